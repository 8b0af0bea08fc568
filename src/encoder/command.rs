use std::path::PathBuf;

use crate::config::{EncoderConfig, Size};

/// Builds the ffmpeg argument list: JPEG frames on stdin plus a looped
/// concat audio source, muxed into a rolling HLS window.
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    framerate: u32,
    audio_list: PathBuf,
    loop_audio: bool,
    scale: Size,
    volume: f32,
    video_codec: String,
    bitrate: String,
    audio_codec: String,
    audio_bitrate: String,
    preset: String,
    segment_time: u32,
    list_size: u32,
    output_path: PathBuf,
}

impl FfmpegCommandBuilder {
    pub fn new(output_path: impl Into<PathBuf>, audio_list: impl Into<PathBuf>) -> Self {
        Self {
            framerate: 10,
            audio_list: audio_list.into(),
            loop_audio: true,
            scale: Size {
                width: 1280,
                height: 720,
            },
            volume: 0.5,
            video_codec: "libx264".to_string(),
            bitrate: "1000k".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            preset: "ultrafast".to_string(),
            segment_time: 2,
            list_size: 2,
            output_path: output_path.into(),
        }
    }

    /// Apply every encoder setting from the config
    pub fn with_config(self, config: &EncoderConfig) -> Self {
        self.with_scale(config.scale)
            .with_volume(config.volume)
            .with_video_codec(config.video_codec.clone())
            .with_bitrate(config.video_bitrate.clone())
            .with_audio_codec(config.audio_codec.clone())
            .with_audio_bitrate(config.audio_bitrate.clone())
            .with_preset(config.preset.clone())
            .with_segments(config.segment_secs, config.list_size)
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_scale(mut self, scale: Size) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_video_codec(mut self, codec: String) -> Self {
        self.video_codec = codec;
        self
    }

    pub fn with_bitrate(mut self, bitrate: String) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_audio_codec(mut self, codec: String) -> Self {
        self.audio_codec = codec;
        self
    }

    pub fn with_audio_bitrate(mut self, bitrate: String) -> Self {
        self.audio_bitrate = bitrate;
        self
    }

    pub fn with_preset(mut self, preset: String) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_segments(mut self, segment_time: u32, list_size: u32) -> Self {
        self.segment_time = segment_time;
        self.list_size = list_size;
        self
    }

    /// Restart the audio list when it runs out
    pub fn with_audio_loop(mut self, loop_audio: bool) -> Self {
        self.loop_audio = loop_audio;
        self
    }

    pub fn build(&self) -> Vec<String> {
        let filter = format!(
            "[0:v]scale={}:{}[v];[1:a]volume={}[a]",
            self.scale.width, self.scale.height, self.volume
        );

        let mut args = vec![
            "-y".to_string(),
            // Video: discrete JPEG images on stdin
            "-f".to_string(), "image2pipe".to_string(),
            "-framerate".to_string(), self.framerate.to_string(),
            "-i".to_string(), "pipe:0".to_string(),
            // Audio: concat list
            "-f".to_string(), "concat".to_string(),
            "-safe".to_string(), "0".to_string(),
        ];
        if self.loop_audio {
            args.extend(["-stream_loop".to_string(), "-1".to_string()]);
        }

        args.extend([
            "-i".to_string(), self.audio_list.to_string_lossy().into_owned(),
            "-filter_complex".to_string(), filter,
            "-map".to_string(), "[v]".to_string(),
            "-map".to_string(), "[a]".to_string(),
            "-c:v".to_string(), self.video_codec.clone(),
            "-c:a".to_string(), self.audio_codec.clone(),
            "-b:a".to_string(), self.audio_bitrate.clone(),
            "-preset".to_string(), self.preset.clone(),
            "-b:v".to_string(), self.bitrate.clone(),
            "-f".to_string(), "hls".to_string(),
            "-hls_time".to_string(), self.segment_time.to_string(),
            "-hls_list_size".to_string(), self.list_size.to_string(),
            "-hls_flags".to_string(), "delete_segments".to_string(),
            self.output_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}
