use crate::compiler::AssemblyInstructions;
use crate::timeline::ticks_to_secs;
use std::path::{Path, PathBuf};

pub struct RenderCommand {
    pub ffmpeg_args: Vec<String>,
    pub output_path: PathBuf,
    /// SRT file the `subtitles` filter reads; must be written before running.
    pub subtitle_path: Option<PathBuf>,
}

fn secs(ticks: i64) -> String {
    format!("{:.6}", ticks_to_secs(ticks))
}

/// Escape a path for use inside an ffmpeg filter argument.
fn filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Generate the FFmpeg command for final assembly: per-clip trim, retime and
/// freeze-frame hold, concatenation, audio concat with trailing pad, and
/// caption burn-in. Output is bounded to the expected duration.
pub fn generate_render_command(instructions: &AssemblyInstructions, output_path: PathBuf) -> RenderCommand {
    let width = instructions.settings.resolution.width;
    let height = instructions.settings.resolution.height;
    let fps = instructions.settings.fps.max(1);
    let expected = secs(instructions.expected_duration_ticks);

    let mut args: Vec<String> = vec!["-v".to_string(), "error".to_string()];
    let mut filter_parts = Vec::new();

    if instructions.video.is_empty() {
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("color=black:size={}x{}:rate={}:d={}", width, height, fps, expected),
        ]);
        filter_parts.push("[0:v]null[vcat]".to_string());
    } else {
        for entry in &instructions.video {
            args.push("-i".to_string());
            args.push(entry.path.to_string_lossy().to_string());
        }
        let last = instructions.video.len() - 1;
        for (idx, entry) in instructions.video.iter().enumerate() {
            let mut hold = entry.hold_ticks;
            if idx == last {
                hold += instructions.video_pad_ticks;
            }
            let mut chain = format!(
                "[{idx}:v]trim=start=0:duration={},setpts=PTS-STARTPTS",
                secs(entry.source_ticks)
            );
            chain.push_str(&format!(
                ",scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps}",
                w = width,
                h = height,
                fps = fps
            ));
            if hold > 0 {
                chain.push_str(&format!(",tpad=stop_mode=clone:stop_duration={}", secs(hold)));
            }
            chain.push_str(&format!("[v{idx}]"));
            filter_parts.push(chain);
        }
        let inputs: String = (0..instructions.video.len()).map(|i| format!("[v{i}]")).collect();
        filter_parts.push(format!("{}concat=n={}:v=1:a=0[vcat]", inputs, instructions.video.len()));
    }

    let subtitle_path = if instructions.captions.is_empty() {
        filter_parts.push("[vcat]null[outv]".to_string());
        None
    } else {
        let path = output_path.with_extension("srt");
        filter_parts.push(format!("[vcat]subtitles='{}'[outv]", filter_path(&path)));
        Some(path)
    };

    let audio_offset = instructions.video.len().max(1);
    if instructions.audio.is_empty() {
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            "anullsrc=r=48000:cl=stereo".to_string(),
        ]);
        filter_parts.push(format!("[{audio_offset}:a]atrim=duration={expected}[outa]"));
    } else {
        for entry in &instructions.audio {
            args.push("-i".to_string());
            args.push(entry.path.to_string_lossy().to_string());
        }
        for (idx, entry) in instructions.audio.iter().enumerate() {
            filter_parts.push(format!(
                "[{}:a]atrim=start=0:duration={},asetpts=PTS-STARTPTS,aresample=48000,aformat=channel_layouts=stereo[a{}]",
                audio_offset + idx,
                secs(entry.duration_ticks),
                idx
            ));
        }
        let inputs: String = (0..instructions.audio.len()).map(|i| format!("[a{i}]")).collect();
        filter_parts.push(format!(
            "{}concat=n={}:v=0:a=1,apad=whole_dur={}[outa]",
            inputs,
            instructions.audio.len(),
            expected
        ));
    }

    args.push("-filter_complex".to_string());
    args.push(filter_parts.join(";"));
    for arg in [
        "-map", "[outv]", "-map", "[outa]", "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-pix_fmt",
        "yuv420p", "-c:a", "aac", "-b:a", "128k", "-t",
    ] {
        args.push(arg.to_string());
    }
    args.push(expected);
    args.push("-y".to_string());
    args.push(output_path.to_string_lossy().to_string());

    RenderCommand {
        ffmpeg_args: args,
        output_path,
        subtitle_path,
    }
}
