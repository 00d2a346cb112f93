//! SDP codec preference rewriting
//!
//! Reorders the payload types on `m=video` lines so the wanted codec comes
//! first. The transform is textual: every other line, and every line ending,
//! is left byte-for-byte as it was.

use std::collections::HashMap;

/// Move payload types whose `a=rtpmap` encoding name equals `codec`
/// (case-insensitive) to the front of each video media line.
///
/// Relative order inside the matching and non-matching groups is kept.
/// Without a video section, or without a matching payload type, the input
/// is returned unchanged.
pub fn prefer_codec(sdp: &str, codec: &str) -> String {
    let lines: Vec<&str> = sdp.split_inclusive('\n').collect();
    let mut out = String::with_capacity(sdp.len());

    let mut start = 0;
    while start < lines.len() {
        // A section runs from one m= line to the next.
        let end = lines[start + 1..]
            .iter()
            .position(|l| l.starts_with("m="))
            .map(|p| start + 1 + p)
            .unwrap_or(lines.len());

        let section = &lines[start..end];
        match section.first() {
            Some(first) if first.starts_with("m=video ") => {
                out.push_str(&reorder_media_line(first, section, codec));
                section[1..].iter().for_each(|l| out.push_str(l));
            }
            _ => section.iter().for_each(|l| out.push_str(l)),
        }

        start = end;
    }

    out
}

fn reorder_media_line(m_line: &str, section: &[&str], codec: &str) -> String {
    let (content, ending) = split_line_ending(m_line);
    let fields: Vec<&str> = content.split(' ').collect();

    // m=video <port> <proto> <fmt> ...
    if fields.len() < 4 {
        return m_line.to_string();
    }

    let names = rtpmap_names(section);
    let (preferred, others): (Vec<&str>, Vec<&str>) = fields[3..]
        .iter()
        .copied()
        .partition(|pt| {
            names
                .get(*pt)
                .map(|name| name.eq_ignore_ascii_case(codec))
                .unwrap_or(false)
        });

    if preferred.is_empty() {
        return m_line.to_string();
    }

    let mut reordered: Vec<&str> = fields[..3].to_vec();
    reordered.extend(preferred);
    reordered.extend(others);

    format!("{}{}", reordered.join(" "), ending)
}

/// `a=rtpmap:<pt> <name>/<clock>[/<channels>]` → pt to encoding name.
fn rtpmap_names<'a>(section: &[&'a str]) -> HashMap<&'a str, &'a str> {
    section
        .iter()
        .filter_map(|line| {
            let (content, _) = split_line_ending(*line);
            let rest = content.strip_prefix("a=rtpmap:")?;
            let (pt, encoding) = rest.split_once(' ')?;
            let name = encoding.split('/').next()?;
            Some((pt.trim(), name.trim()))
        })
        .collect()
}

fn split_line_ending(line: &str) -> (&str, &str) {
    let content = line.trim_end_matches(['\r', '\n']);
    (content, &line[content.len()..])
}

/// Payload types listed on the first `m=video` line, in order.
pub fn video_payload_order(sdp: &str) -> Vec<String> {
    sdp.lines()
        .find(|l| l.starts_with("m=video "))
        .map(|l| {
            l.trim_end()
                .split(' ')
                .skip(3)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 102 103 45\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 profile-level-id=42e01f\r\n\
a=rtpmap:103 h264/90000\r\n\
a=rtpmap:45 AV1/90000\r\n";

    #[test]
    fn moves_h264_to_front() {
        let patched = prefer_codec(OFFER, "H264");
        assert_eq!(
            video_payload_order(&patched),
            vec!["102", "103", "96", "97", "45"]
        );
    }

    #[test]
    fn leaves_other_lines_untouched() {
        let patched = prefer_codec(OFFER, "H264");
        let before: Vec<&str> = OFFER.lines().filter(|l| !l.starts_with("m=video")).collect();
        let after: Vec<&str> = patched
            .lines()
            .filter(|l| !l.starts_with("m=video"))
            .collect();
        assert_eq!(before, after);
        assert!(patched.ends_with("\r\n"));
        assert_eq!(patched.len(), OFFER.len());
    }

    #[test]
    fn absent_codec_is_identity() {
        assert_eq!(prefer_codec(OFFER, "VP9"), OFFER);
    }

    #[test]
    fn no_video_section_is_identity() {
        let audio_only = "v=0\nm=audio 9 RTP/AVP 0\na=rtpmap:0 PCMU/8000\n";
        assert_eq!(prefer_codec(audio_only, "H264"), audio_only);
    }

    #[test]
    fn audio_section_is_not_reordered() {
        let sdp = "m=audio 9 RTP/AVP 0 8\na=rtpmap:0 PCMU/8000\na=rtpmap:8 PCMA/8000\n";
        assert_eq!(prefer_codec(sdp, "PCMA"), sdp);
    }

    #[test]
    fn every_video_section_is_patched() {
        let sdp = "m=video 9 RTP/AVP 96 98\na=rtpmap:96 VP8/90000\na=rtpmap:98 H264/90000\n\
m=video 9 RTP/AVP 100 101\na=rtpmap:100 VP8/90000\na=rtpmap:101 H264/90000\n";
        let patched = prefer_codec(sdp, "H264");
        assert!(patched.contains("m=video 9 RTP/AVP 98 96\n"));
        assert!(patched.contains("m=video 9 RTP/AVP 101 100\n"));
    }

    #[test]
    fn rtpmap_in_other_section_does_not_count() {
        let sdp = "m=audio 9 RTP/AVP 96\na=rtpmap:96 H264/90000\n\
m=video 9 RTP/AVP 97 96\na=rtpmap:97 VP8/90000\na=rtpmap:96 VP8/90000\n";
        assert_eq!(prefer_codec(sdp, "H264"), sdp);
    }
}
