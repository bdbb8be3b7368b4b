use std::path::PathBuf;

use crate::resolver::ResolvedStream;

pub const SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceInput {
    Stream {
        endpoint: String,
        seek: f64,
    },
    /// Music continuation with a clip summed over it.
    Mix {
        endpoint: String,
        seek: f64,
        clip: PathBuf,
        clip_volume: f32,
    },
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioResource {
    pub input: ResourceInput,
    pub volume: f32,
    pub title: Option<String>,
    pub duration: Option<f64>,
}

impl AudioResource {
    pub fn stream(stream: &ResolvedStream, seek: f64, volume: f32, title: &str) -> Self {
        Self {
            input: ResourceInput::Stream {
                endpoint: stream.endpoint.clone(),
                seek: seek.max(0.0),
            },
            volume: clamp_volume(volume),
            title: Some(title.to_string()),
            duration: stream.duration,
        }
    }

    pub fn mix(stream: &ResolvedStream, seek: f64, clip: PathBuf, clip_volume: f32, volume: f32, title: &str) -> Self {
        Self {
            input: ResourceInput::Mix {
                endpoint: stream.endpoint.clone(),
                seek: seek.max(0.0),
                clip,
                clip_volume: clamp_volume(clip_volume),
            },
            volume: clamp_volume(volume),
            title: Some(title.to_string()),
            duration: stream.duration,
        }
    }

    pub fn file(path: PathBuf, volume: f32) -> Self {
        Self {
            input: ResourceInput::File(path),
            volume: clamp_volume(volume),
            title: None,
            duration: None,
        }
    }

    pub fn is_mix(&self) -> bool {
        matches!(self.input, ResourceInput::Mix { .. })
    }

    /// Arguments for an ffmpeg process writing raw PCM to stdout.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];

        match &self.input {
            ResourceInput::Stream { endpoint, seek } => {
                push_input(&mut args, endpoint, *seek);
            }
            ResourceInput::Mix { endpoint, seek, clip, clip_volume } => {
                push_input(&mut args, endpoint, *seek);
                args.push("-i".to_string());
                args.push(clip.to_string_lossy().into_owned());
                args.push("-filter_complex".to_string());
                args.push(format!(
                    "[1:a]volume={clip_volume:.2}[clip];[0:a][clip]amix=inputs=2:duration=first:dropout_transition=0:normalize=0[out]"
                ));
                args.push("-map".to_string());
                args.push("[out]".to_string());
            }
            ResourceInput::File(path) => {
                args.push("-i".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
        }

        args.extend(
            ["-f", "f32le", "-ac", "2", "-ar", "48000", "-acodec", "pcm_f32le", "-"]
                .iter()
                .map(|arg| arg.to_string()),
        );

        args
    }
}

fn push_input(args: &mut Vec<String>, endpoint: &str, seek: f64) {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        args.extend(
            ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
                .iter()
                .map(|arg| arg.to_string()),
        );
    }

    if seek > 0.0 {
        args.push("-ss".to_string());
        args.push(format!("{seek:.3}"));
    }

    args.push("-i".to_string());
    args.push(endpoint.to_string());
}

pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 1.0;
    }
    volume.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;

    fn remote() -> ResolvedStream {
        ResolvedStream {
            endpoint: "https://cdn.example.com/audio.webm".to_string(),
            duration: Some(200.0),
            source: SourceKind::YouTube,
        }
    }

    fn position_of(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|arg| arg == flag)
    }

    #[test]
    fn remote_stream_reconnects_and_outputs_float_pcm() {
        let args = AudioResource::stream(&remote(), 0.0, 0.5, "song").ffmpeg_args();

        assert!(position_of(&args, "-reconnect").is_some());
        assert!(position_of(&args, "-ss").is_none());
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "f32le"));
    }

    #[test]
    fn seek_goes_before_the_input() {
        let args = AudioResource::stream(&remote(), 42.0, 0.5, "song").ffmpeg_args();

        let ss = position_of(&args, "-ss").unwrap();
        let input = position_of(&args, "-i").unwrap();
        assert_eq!(args[ss + 1], "42.000");
        assert!(ss < input);
    }

    #[test]
    fn mix_has_two_inputs_and_amix() {
        let resource = AudioResource::mix(&remote(), 12.5, PathBuf::from("sounds/airhorn.ogg"), 0.8, 0.6, "song");
        let args = resource.ffmpeg_args();

        assert!(resource.is_mix());
        assert_eq!(args.iter().filter(|arg| *arg == "-i").count(), 2);
        let graph = &args[position_of(&args, "-filter_complex").unwrap() + 1];
        assert!(graph.contains("amix=inputs=2:duration=first"));
        assert!(graph.contains("volume=0.80"));
    }

    #[test]
    fn local_file_has_no_reconnect() {
        let args = AudioResource::file(PathBuf::from("/tmp/clip.wav"), 1.0).ffmpeg_args();
        assert!(position_of(&args, "-reconnect").is_none());
    }

    #[test]
    fn volume_is_clamped() {
        assert_eq!(clamp_volume(1.7), 1.0);
        assert_eq!(clamp_volume(-0.2), 0.0);
        assert_eq!(clamp_volume(f32::NAN), 1.0);
    }
}
