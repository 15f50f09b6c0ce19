//! Face detection through an external helper process.
//!
//! Per request the daemon writes one JSON header line followed by the raw
//! 8-bit grayscale pixels:
//!
//! ```text
//! {"width":640,"height":480,"format":"gray8","length":307200}\n<307200 bytes>
//! ```
//!
//! and reads back one JSON line, either
//! `{"faces":[{"bbox":{...},"embedding":{"values":[...]}}]}` or
//! `{"error":"..."}`.

use facetrack_core::{DetectedFace, DetectorError, FaceDetector};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

#[derive(Serialize)]
struct RequestHeader<'a> {
    width: u32,
    height: u32,
    format: &'a str,
    length: usize,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    faces: Vec<DetectedFace>,
    #[serde(default)]
    error: Option<String>,
}

struct Helper {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for Helper {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Runs the configured detector command and talks to it over stdio.
///
/// The helper is spawned on first use and respawned on the next request
/// after it dies.
pub struct SubprocessDetector {
    command: Vec<String>,
    helper: Option<Helper>,
}

impl SubprocessDetector {
    pub fn new(command: Vec<String>) -> Result<Self, DetectorError> {
        if command.first().map_or(true, |p| p.is_empty()) {
            return Err(DetectorError::Unavailable(
                "no detector command configured".into(),
            ));
        }
        Ok(Self {
            command,
            helper: None,
        })
    }

    fn spawn(&self) -> Result<Helper, DetectorError> {
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                DetectorError::Unavailable(format!("failed to spawn {}: {e}", self.command[0]))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(DetectorError::Unavailable(
                "detector stdio not captured".into(),
            ));
        };
        tracing::info!(command = ?self.command, pid = child.id(), "detector helper started");
        Ok(Helper {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn exchange(
        helper: &mut Helper,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let header = RequestHeader {
            width,
            height,
            format: "gray8",
            length: pixels.len(),
        };
        let mut line = serde_json::to_vec(&header)
            .map_err(|e| DetectorError::InferenceFailed(format!("encode request: {e}")))?;
        line.push(b'\n');
        helper.stdin.write_all(&line)?;
        helper.stdin.write_all(pixels)?;
        helper.stdin.flush()?;

        let mut reply = String::new();
        if helper.stdout.read_line(&mut reply)? == 0 {
            return Err(DetectorError::Unavailable("detector helper exited".into()));
        }
        parse_response(&reply)
    }
}

impl FaceDetector for SubprocessDetector {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {expected} pixels for {width}x{height}, got {}",
                pixels.len()
            )));
        }

        let mut helper = match self.helper.take() {
            Some(helper) => helper,
            None => self.spawn()?,
        };
        match Self::exchange(&mut helper, pixels, width, height) {
            Ok(faces) => {
                self.helper = Some(helper);
                Ok(faces)
            }
            Err(e @ DetectorError::InferenceFailed(_)) => {
                self.helper = Some(helper);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "detector helper failed; will respawn");
                drop(helper);
                match e {
                    DetectorError::Io(io) => Err(DetectorError::Unavailable(format!(
                        "detector helper I/O: {io}"
                    ))),
                    other => Err(other),
                }
            }
        }
    }
}

fn parse_response(line: &str) -> Result<Vec<DetectedFace>, DetectorError> {
    let response: Response = serde_json::from_str(line.trim())
        .map_err(|e| DetectorError::InferenceFailed(format!("malformed detector reply: {e}")))?;
    if let Some(error) = response.error {
        return Err(DetectorError::InferenceFailed(error));
    }
    let mut faces = response.faces;
    faces.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));
    Ok(faces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_faces_sorted_by_confidence() {
        let line = r#"{"faces":[
            {"bbox":{"x":0,"y":0,"width":10,"height":10,"confidence":0.7},"embedding":{"values":[0.1,0.2]}},
            {"bbox":{"x":5,"y":5,"width":10,"height":10,"confidence":0.95},"embedding":{"values":[0.3,0.4]}}
        ]}"#
        .replace('\n', "");
        let faces = parse_response(&line).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].bbox.confidence, 0.95);
        assert_eq!(faces[0].embedding.values, vec![0.3, 0.4]);
    }

    #[test]
    fn test_parse_error_and_garbage() {
        assert!(matches!(
            parse_response(r#"{"error":"model not loaded"}"#),
            Err(DetectorError::InferenceFailed(msg)) if msg == "model not loaded"
        ));
        assert!(matches!(
            parse_response("not json"),
            Err(DetectorError::InferenceFailed(_))
        ));
        assert!(parse_response(r#"{"faces":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_empty_command() {
        assert!(matches!(
            SubprocessDetector::new(vec![]),
            Err(DetectorError::Unavailable(_))
        ));
    }

    #[test]
    fn test_pixel_count_must_match_dimensions() {
        let mut detector = SubprocessDetector::new(vec!["/bin/true".into()]).unwrap();
        assert!(matches!(
            detector.detect(&[0; 3], 2, 2),
            Err(DetectorError::InferenceFailed(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_round_trip_with_shell_helper() {
        let script = r#"
while IFS= read -r header; do
  n=$(printf '%s' "$header" | sed 's/.*"length":\([0-9]*\).*/\1/')
  dd bs=1 count="$n" of=/dev/null 2>/dev/null
  echo '{"faces":[{"bbox":{"x":1,"y":2,"width":3,"height":4,"confidence":0.9},"embedding":{"values":[1.0,0.0]}}]}'
done
"#;
        let mut detector =
            SubprocessDetector::new(vec!["/bin/sh".into(), "-c".into(), script.into()]).unwrap();

        for _ in 0..2 {
            let faces = detector.detect(&[7u8; 12], 4, 3).unwrap();
            assert_eq!(faces.len(), 1);
            assert_eq!(faces[0].bbox.x, 1.0);
            assert_eq!(faces[0].embedding.values, vec![1.0, 0.0]);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_exit_is_unavailable() {
        let mut detector =
            SubprocessDetector::new(vec!["/bin/sh".into(), "-c".into(), "exit 0".into()]).unwrap();
        assert!(matches!(
            detector.detect(&[0u8; 4], 2, 2),
            Err(DetectorError::Unavailable(_))
        ));
    }
}
