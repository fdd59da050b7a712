//! SDP munging
//!
//! Every local description the server emits forces Opus to mono by making
//! the matching `a=fmtp:` line carry `stereo=0;sprop-stereo=0`. This is a
//! deliberate string transform, not a parser: only that one token sequence
//! changes and the rest of the SDP passes through verbatim.

use regex::Regex;

/// Ensure `stereo=0;sprop-stereo=0` on the fmtp line of every Opus payload
/// type. Idempotent: re-applying to already-munged SDP yields identical
/// output.
pub fn munge_opus_mono(sdp: &str) -> String {
    let Ok(rtpmap) = Regex::new(r"a=rtpmap:(\d+) opus/48000/2") else {
        return sdp.to_string();
    };

    let payload_types: Vec<String> = rtpmap
        .captures_iter(sdp)
        .map(|caps| caps[1].to_string())
        .collect();
    if payload_types.is_empty() {
        return sdp.to_string();
    }

    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let had_trailing_newline = sdp.ends_with('\n');

    let mut lines: Vec<String> = sdp.lines().map(|l| l.to_string()).collect();

    for pt in &payload_types {
        let fmtp_prefix = format!("a=fmtp:{} ", pt);
        let rtpmap_line = format!("a=rtpmap:{} opus/48000/2", pt);

        if let Some(line) = lines.iter_mut().find(|l| l.starts_with(&fmtp_prefix)) {
            let params = &line[fmtp_prefix.len()..];
            *line = format!("{}{}", fmtp_prefix, force_mono_params(params));
        } else if let Some(pos) = lines.iter().position(|l| l.starts_with(&rtpmap_line)) {
            lines.insert(
                pos + 1,
                format!("a=fmtp:{} stereo=0;sprop-stereo=0", pt),
            );
        }
    }

    let mut out = lines.join(newline);
    if had_trailing_newline {
        out.push_str(newline);
    }
    out
}

/// Rewrite an fmtp parameter list so `stereo` and `sprop-stereo` are both 0,
/// preserving the order and values of everything else.
fn force_mono_params(params: &str) -> String {
    let mut parts: Vec<String> = params
        .split(';')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect();

    for key in ["stereo", "sprop-stereo"] {
        let prefix = format!("{}=", key);
        match parts.iter_mut().find(|p| p.starts_with(&prefix)) {
            Some(part) => *part = format!("{}=0", key),
            None => parts.push(format!("{}=0", key)),
        }
    }

    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP_WITH_FMTP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10;useinbandfec=1\r\n";

    const SDP_WITHOUT_FMTP: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=rtcp-mux\r\n";

    #[test]
    fn appends_mono_params_to_existing_fmtp() {
        let munged = munge_opus_mono(SDP_WITH_FMTP);
        assert!(munged.contains("a=fmtp:111 minptime=10;useinbandfec=1;stereo=0;sprop-stereo=0"));
    }

    #[test]
    fn inserts_fmtp_line_when_missing() {
        let munged = munge_opus_mono(SDP_WITHOUT_FMTP);
        assert!(munged.contains("a=rtpmap:111 opus/48000/2\r\na=fmtp:111 stereo=0;sprop-stereo=0\r\na=rtcp-mux"));
    }

    #[test]
    fn overrides_stereo_one() {
        let sdp = "m=audio 9 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 stereo=1;sprop-stereo=1;useinbandfec=1\r\n";
        let munged = munge_opus_mono(sdp);
        assert!(munged.contains("a=fmtp:111 stereo=0;sprop-stereo=0;useinbandfec=1"));
        assert!(!munged.contains("stereo=1"));
    }

    #[test]
    fn munging_is_idempotent() {
        let once = munge_opus_mono(SDP_WITH_FMTP);
        let twice = munge_opus_mono(&once);
        assert_eq!(once, twice);

        let once = munge_opus_mono(SDP_WITHOUT_FMTP);
        let twice = munge_opus_mono(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_opus_sdp_passes_through() {
        let sdp = "v=0\r\nm=video 9 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        assert_eq!(munge_opus_mono(sdp), sdp);
    }

    #[test]
    fn handles_multiple_opus_payload_types() {
        let sdp = "m=audio 9 RTP/AVP 111 109\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 useinbandfec=1\r\na=rtpmap:109 opus/48000/2\r\n";
        let munged = munge_opus_mono(sdp);
        assert!(munged.contains("a=fmtp:111 useinbandfec=1;stereo=0;sprop-stereo=0"));
        assert!(munged.contains("a=fmtp:109 stereo=0;sprop-stereo=0"));
    }
}
