/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Minimal SDP inspection. The session never rewrites SDP; it only reads
//! what was negotiated.

/// Header extension that lets receivers learn about simulcast layer
/// changes without renegotiation.
pub const VIDEO_LAYERS_ALLOCATION_EXTENSION: &str =
    "http://www.webrtc.org/experiments/rtp-hdrext/video-layers-allocation00";

fn video_sections(sdp: &str) -> impl Iterator<Item = Vec<&str>> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    let mut in_video = false;
    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
            if in_video {
                sections.push(Vec::new());
            }
            continue;
        }
        if in_video {
            if let Some(section) = sections.last_mut() {
                section.push(line);
            }
        }
    }
    sections.into_iter()
}

/// Codec names from the `a=rtpmap` lines of every video section, in order
/// of first appearance. Retransmission and FEC entries are skipped.
pub fn video_codec_names(sdp: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for section in video_sections(sdp) {
        for line in section {
            let Some(rest) = line.strip_prefix("a=rtpmap:") else {
                continue;
            };
            let Some(encoding) = rest.split_whitespace().nth(1) else {
                continue;
            };
            let name = encoding.split('/').next().unwrap_or_default().to_uppercase();
            if matches!(name.as_str(), "RTX" | "RED" | "ULPFEC" | "FLEXFEC-03") {
                continue;
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

pub fn has_video_header_extension(sdp: &str, uri: &str) -> bool {
    video_sections(sdp).any(|section| {
        section
            .iter()
            .any(|line| line.starts_with("a=extmap:") && line.ends_with(uri))
    })
}

pub fn count_candidates(sdp: &str) -> usize {
    sdp.lines()
        .filter(|line| line.trim_start().starts_with("a=candidate:"))
        .count()
}
