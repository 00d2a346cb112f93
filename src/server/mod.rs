//! Local WHIP ingest sink
//!
//! A rouille HTTP endpoint accepts WHIP offers and hands each answered
//! [`Rtc`] to a media loop thread that owns one UDP socket for every
//! publisher. Media is counted and dropped. Good enough to publish against
//! without a media server.

pub mod client;

use std::{
    collections::HashSet,
    io::{ErrorKind, Read},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use rouille::{Request, Response, Server};
use serde::Serialize;
use str0m::{
    change::SdpOffer,
    net::{Protocol, Receive},
    Candidate, Input, Rtc,
};
use tracing::{debug, info, warn};

use crate::util::select_host_address;

use self::client::{IngestClient, ResourceId};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub bind: SocketAddr,
    /// Address offered as the ICE host candidate. Defaults to the first
    /// routable interface, then loopback.
    pub media_ip: Option<IpAddr>,
    /// Bearer token publishers must present. `None` accepts anyone.
    pub token: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8889),
            media_ip: None,
            token: None,
        }
    }
}

/// Counters shared by the HTTP side and the media loop.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub frames: AtomicU64,
    pub published: AtomicU64,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    sessions: usize,
    published: u64,
    frames: u64,
}

enum Command {
    Add(IngestClient),
    Remove(ResourceId),
}

struct Ingest {
    media_addr: SocketAddr,
    token: Option<String>,
    commands: Mutex<Sender<Command>>,
    resources: Mutex<HashSet<ResourceId>>,
    stats: Arc<IngestStats>,
}

pub struct IngestHandle {
    addr: SocketAddr,
    media_addr: SocketAddr,
    stats: Arc<IngestStats>,
    http: Option<JoinHandle<()>>,
    stop: Option<Sender<()>>,
}

impl IngestHandle {
    /// Where the HTTP endpoint listens.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// WHIP endpoint for `stream_id`, as reachable on loopback.
    pub fn whip_url(&self, stream_id: u64) -> String {
        format!(
            "http://127.0.0.1:{}/stream/{}/whip",
            self.addr.port(),
            stream_id
        )
    }

    /// Block until the HTTP server stops.
    pub fn wait(mut self) {
        if let Some(http) = self.http.take() {
            let _ = http.join();
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(http) = self.http.take() {
            let _ = http.join();
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind the media socket, start the media loop and the HTTP endpoint.
pub fn start(config: IngestConfig) -> anyhow::Result<IngestHandle> {
    let media_ip = config
        .media_ip
        .or_else(select_host_address)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let socket = UdpSocket::bind(SocketAddr::new(media_ip, 0))?;
    let media_addr = socket.local_addr()?;
    info!("Bound UDP port: {}", media_addr);

    let stats = Arc::new(IngestStats::default());
    let (tx, rx) = mpsc::channel();

    let loop_stats = stats.clone();
    thread::Builder::new()
        .name("ingest-media".into())
        .spawn(move || run(socket, rx, &loop_stats))?;

    let ingest = Arc::new(Ingest {
        media_addr,
        token: config.token,
        commands: Mutex::new(tx),
        resources: Mutex::new(HashSet::new()),
        stats: stats.clone(),
    });

    let server = Server::new(config.bind, move |request| web_request(request, &ingest))
        .map_err(|e| anyhow!("starting the web server: {e}"))?;
    let addr = server.server_addr();
    info!("WHIP ingest listening on http://{}", addr);

    let (http, stop) = server.stoppable();

    Ok(IngestHandle {
        addr,
        media_addr,
        stats,
        http: Some(http),
        stop: Some(stop),
    })
}

/// Run the sink until the process is terminated.
pub fn main(bind: SocketAddr, token: Option<String>) -> anyhow::Result<()> {
    let handle = start(IngestConfig {
        bind,
        media_ip: None,
        token,
    })?;
    info!("Publish to {}", handle.whip_url(1));
    handle.wait();
    Ok(())
}

fn run(socket: UdpSocket, rx: Receiver<Command>, stats: &IngestStats) {
    let mut clients: Vec<IngestClient> = vec![];
    let mut buf = vec![0; 2000];

    loop {
        clients.retain(|c| {
            if !c.rtc.is_alive() {
                info!("Publisher {} gone after {} frames", c.id, c.frames());
            }
            c.rtc.is_alive()
        });

        loop {
            match rx.try_recv() {
                Ok(Command::Add(client)) => clients.push(client),
                Ok(Command::Remove(id)) => {
                    if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
                        client.rtc.disconnect();
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Ingest media loop stopped");
                    return;
                }
            }
        }

        let mut timeout = Instant::now() + Duration::from_millis(100);
        for client in clients.iter_mut() {
            timeout = timeout.min(client.poll_until_timeout(&socket, stats));
        }

        // The read timeout is not allowed to be 0.
        let duration = timeout
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        if let Err(e) = socket.set_read_timeout(Some(duration)) {
            warn!("Setting socket read timeout failed: {}", e);
            return;
        }

        if let Some(input) = read_socket_input(&socket, &mut buf) {
            // Demultiplex by asking each Rtc whether the datagram is theirs.
            if let Some(client) = clients.iter_mut().find(|c| c.accepts(&input)) {
                client.handle_input(input);
            } else {
                // Common when STUN arrives before the Rtc got here.
                debug!("No publisher accepts UDP input: {:?}", input);
            }
        }

        let now = Instant::now();
        for client in &mut clients {
            client.handle_input(Input::Timeout(now));
        }
    }
}

fn read_socket_input<'a>(socket: &UdpSocket, buf: &'a mut Vec<u8>) -> Option<Input<'a>> {
    buf.resize(2000, 0);

    match socket.recv_from(buf) {
        Ok((n, source)) => {
            buf.truncate(n);

            let Ok(contents) = buf.as_slice().try_into() else {
                return None;
            };
            let destination = socket.local_addr().ok()?;

            Some(Input::Receive(
                Instant::now(),
                Receive {
                    proto: Protocol::Udp,
                    source,
                    destination,
                    contents,
                },
            ))
        }

        Err(e) => match e.kind() {
            // Expected with set_read_timeout(). One for windows, one for the rest.
            ErrorKind::WouldBlock | ErrorKind::TimedOut => None,
            _ => {
                warn!("UdpSocket read failed: {:?}", e);
                None
            }
        },
    }
}

fn web_request(request: &Request, ingest: &Ingest) -> Response {
    debug!("{} {}", request.method(), request.url());

    if request.method() == "GET" && request.url() == "/status" {
        return status(ingest);
    }

    if let Some(rejected) = check_auth(request, ingest.token.as_deref()) {
        return rejected;
    }

    let url = request.url();
    match request.method() {
        "POST" if url.ends_with("/whip") => publish(request, ingest),
        "DELETE" if url.contains("/whip/") => remove(&url, ingest),
        _ => Response::empty_404(),
    }
}

fn check_auth(request: &Request, token: Option<&str>) -> Option<Response> {
    let token = token?;
    match request.header("Authorization") {
        None => Some(Response::text("missing bearer token").with_status_code(401)),
        Some(value) if value.strip_prefix("Bearer ") == Some(token) => None,
        Some(_) => Some(Response::text("invalid bearer token").with_status_code(403)),
    }
}

fn publish(request: &Request, ingest: &Ingest) -> Response {
    let is_sdp = request
        .header("Content-Type")
        .map(|ct| ct.starts_with("application/sdp"))
        .unwrap_or(false);
    if !is_sdp {
        return Response::text("expected application/sdp").with_status_code(415);
    }

    let mut body = String::new();
    let read = match request.data() {
        Some(mut data) => data.read_to_string(&mut body),
        None => return Response::text("body already consumed").with_status_code(500),
    };
    if let Err(e) = read {
        return Response::text(format!("unreadable body: {e}")).with_status_code(400);
    }

    let offer = match SdpOffer::from_sdp_string(&body) {
        Ok(offer) => offer,
        Err(e) => return Response::text(format!("invalid offer: {e:?}")).with_status_code(400),
    };

    let mut rtc = Rtc::builder().build();
    match Candidate::host(ingest.media_addr, "udp") {
        Ok(candidate) => {
            rtc.add_local_candidate(candidate);
        }
        Err(e) => {
            warn!("No host candidate for {}: {:?}", ingest.media_addr, e);
            return Response::text("ingest misconfigured").with_status_code(500);
        }
    }

    let answer = match rtc.sdp_api().accept_offer(offer) {
        Ok(answer) => answer,
        Err(e) => return Response::text(format!("offer rejected: {e:?}")).with_status_code(400),
    };

    let id = ResourceId::next();
    let sent = ingest
        .commands
        .lock()
        .map(|tx| tx.send(Command::Add(IngestClient::new(id, rtc))).is_ok())
        .unwrap_or(false);
    if !sent {
        return Response::text("media loop stopped").with_status_code(503);
    }

    if let Ok(mut resources) = ingest.resources.lock() {
        resources.insert(id);
    }
    ingest.stats.published.fetch_add(1, Ordering::Relaxed);

    let location = format!("{}/{}", request.url(), id);
    info!("Publisher {} accepted at {}", id, location);

    Response::from_data("application/sdp", answer.to_sdp_string())
        .with_status_code(201)
        .with_additional_header("Location", location)
}

fn remove(url: &str, ingest: &Ingest) -> Response {
    let id = url
        .rsplit('/')
        .next()
        .and_then(|last| last.strip_prefix('r'))
        .and_then(|n| n.parse().ok())
        .map(ResourceId);
    let Some(id) = id else {
        return Response::empty_404();
    };

    let known = ingest
        .resources
        .lock()
        .map(|mut r| r.remove(&id))
        .unwrap_or(false);
    if !known {
        return Response::empty_404();
    }

    if let Ok(tx) = ingest.commands.lock() {
        let _ = tx.send(Command::Remove(id));
    }
    info!("Publisher {} released", id);
    Response::empty_204()
}

fn status(ingest: &Ingest) -> Response {
    let body = StatusBody {
        sessions: ingest.resources.lock().map(|r| r.len()).unwrap_or(0),
        published: ingest.stats.published.load(Ordering::Relaxed),
        frames: ingest.stats.frames.load(Ordering::Relaxed),
    };
    match serde_json::to_vec(&body) {
        Ok(json) => Response::from_data("application/json", json),
        Err(_) => Response::text("").with_status_code(500),
    }
}
