//! Session description handed to the transcoder so it can receive the tapped
//! RTP stream.

use crate::engine::CodecInfo;

/// Receive-only audio description for `ip:audio_port`.
pub fn audio_sdp(ip: &str, audio_port: u16, codec: &CodecInfo) -> String {
    let rtpmap = match codec.channels {
        Some(channels) => format!(
            "{}/{}/{}",
            codec.codec_name, codec.clock_rate, channels
        ),
        None => format!("{}/{}", codec.codec_name, codec.clock_rate),
    };

    [
        "v=0".to_string(),
        format!("o=- 0 0 IN IP4 {ip}"),
        "s=FFmpeg".to_string(),
        format!("c=IN IP4 {ip}"),
        "t=0 0".to_string(),
        format!("m=audio {} RTP/AVP {}", audio_port, codec.payload_type),
        format!("a=rtpmap:{} {}", codec.payload_type, rtpmap),
        "a=sendonly".to_string(),
        String::new(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_description() {
        let codec = CodecInfo {
            payload_type: 100,
            codec_name: "opus".into(),
            clock_rate: 48000,
            channels: Some(2),
            ssrc: Some(42),
        };

        let sdp = audio_sdp("127.0.0.1", 8010, &codec);
        let lines: Vec<&str> = sdp.lines().collect();

        assert_eq!(lines[0], "v=0");
        assert_eq!(lines[1], "o=- 0 0 IN IP4 127.0.0.1");
        assert_eq!(lines[3], "c=IN IP4 127.0.0.1");
        assert_eq!(lines[5], "m=audio 8010 RTP/AVP 100");
        assert_eq!(lines[6], "a=rtpmap:100 opus/48000/2");
        assert_eq!(lines[7], "a=sendonly");
        assert!(sdp.ends_with('\n'));
    }

    #[test]
    fn test_rtpmap_without_channels() {
        let codec = CodecInfo {
            payload_type: 0,
            codec_name: "PCMU".into(),
            clock_rate: 8000,
            channels: None,
            ssrc: None,
        };
        assert!(audio_sdp("10.0.0.1", 9000, &codec).contains("a=rtpmap:0 PCMU/8000\n"));
    }
}
