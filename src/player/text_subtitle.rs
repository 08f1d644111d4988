use crate::core::{
    msec_to_time, DemuxPacket, PlayerError, Result, StreamInfo, StreamSource, StreamType,
};
use crate::player::source::{Source, SourceCaps};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// 支持的字幕文件扩展名
const SUBTITLE_EXTENSIONS: [&str; 4] = ["srt", "ass", "ssa", "vtt"];

/// 一条字幕
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

/// 外挂文本字幕数据源（SRT / ASS / SSA / VTT）
///
/// 整个文件在打开时解析完，之后按时间顺序把每条字幕作为一个数据包吐出。
pub struct TextSubtitleSource {
    path: PathBuf,
    info: StreamInfo,
    cues: Vec<SubtitleCue>,
    position: usize,
}

impl TextSubtitleSource {
    pub fn open(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase();
        let mut source = Self::from_content(&content, &extension)?;
        source.path = path.to_path_buf();
        source.info.filename = Some(path.to_path_buf());
        source.info.language = Self::language_from_filename(path).unwrap_or_default();
        source.info.name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        info!(
            "📝 打开外挂字幕: {}（{} 条，语言 {:?}）",
            path.display(),
            source.cues.len(),
            source.info.language
        );
        Ok(source)
    }

    /// 从文本内容构造（`format` 为扩展名）
    pub fn from_content(content: &str, format: &str) -> Result<Self> {
        let mut cues = match format {
            "srt" => parse_srt(content),
            "ass" | "ssa" => parse_ass(content),
            "vtt" => parse_vtt(content),
            _ => {
                return Err(PlayerError::OpenError(format!(
                    "不支持的字幕文件格式: {}",
                    format
                )))
            }
        };
        cues.sort_by_key(|cue| cue.start_ms);

        let info = StreamInfo {
            id: 0,
            stream_type: Some(StreamType::Subtitle),
            codec: format.to_string(),
            ..Default::default()
        };
        Ok(Self {
            path: PathBuf::new(),
            info,
            cues,
            position: 0,
        })
    }

    pub fn cues(&self) -> &[SubtitleCue] {
        &self.cues
    }

    /// video_name.en.srt → "en"
    fn language_from_filename(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let (_, tag) = stem.rsplit_once('.')?;
        let is_language = (2..=7).contains(&tag.len())
            && tag.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
        is_language.then(|| tag.to_string())
    }

    /// 查找与媒体文件同目录下的字幕文件
    ///
    /// 顺序：精确匹配 > 语言标识 > 模糊匹配（前两种都没找到时才做）
    pub fn find_sidecar_files(media_path: &Path) -> Vec<PathBuf> {
        let mut subtitle_files = Vec::new();
        let (Some(parent_dir), Some(file_stem)) = (media_path.parent(), media_path.file_stem()) else {
            return subtitle_files;
        };
        let file_stem = file_stem.to_string_lossy();

        // 方法1: 精确匹配 - video_name.srt, video_name.ass 等
        for ext in SUBTITLE_EXTENSIONS {
            let subtitle_path = parent_dir.join(format!("{}.{}", file_stem, ext));
            if subtitle_path.exists() {
                info!("找到精确匹配字幕文件: {}", subtitle_path.display());
                subtitle_files.push(subtitle_path);
            }
        }

        // 方法2: 语言标识匹配 - video_name.en.srt, video_name.fra.srt
        if let Ok(entries) = fs::read_dir(parent_dir) {
            let prefix = format!("{}.", file_stem);
            let mut tagged: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    let name = path.file_name().map(|n| n.to_string_lossy().to_string());
                    name.map_or(false, |name| name.starts_with(&prefix))
                        && Self::has_subtitle_extension(path)
                        && Self::language_from_filename(path).is_some()
                        && !subtitle_files.contains(path)
                })
                .collect();
            tagged.sort();
            for path in &tagged {
                info!("找到语言标识字幕文件: {}", path.display());
            }
            subtitle_files.extend(tagged);
        }

        // 方法3: 模糊匹配 - 同目录下包含相似名称的字幕文件
        if subtitle_files.is_empty() {
            if let Ok(entries) = fs::read_dir(parent_dir) {
                let keywords = extract_keywords(&file_stem);
                let mut fuzzy = Vec::new();
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !Self::has_subtitle_extension(&path) {
                        continue;
                    }
                    let entry_lower = entry.file_name().to_string_lossy().to_lowercase();
                    let match_score = keywords
                        .iter()
                        .filter(|keyword| entry_lower.contains(&keyword.to_lowercase()))
                        .count();
                    if !keywords.is_empty() && match_score >= (keywords.len() / 2).max(1) {
                        info!(
                            "找到模糊匹配字幕文件: {} (匹配度: {}/{})",
                            path.display(),
                            match_score,
                            keywords.len()
                        );
                        fuzzy.push(path);
                    }
                }
                fuzzy.sort();
                subtitle_files.extend(fuzzy);
            }
        }

        subtitle_files
    }

    fn has_subtitle_extension(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| SUBTITLE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
    }
}

impl Source for TextSubtitleSource {
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>> {
        let Some(cue) = self.cues.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Ok(Some(DemuxPacket {
            stream_id: self.info.id,
            dts: Some(msec_to_time(cue.start_ms)),
            pts: Some(msec_to_time(cue.start_ms)),
            duration: Some(msec_to_time(cue.end_ms - cue.start_ms)),
            data: cue.text.as_bytes().to_vec(),
            pts_offset_correction: 0,
        }))
    }

    fn stream(&self, id: i32) -> Option<StreamInfo> {
        (id == self.info.id).then(|| self.info.clone())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        vec![self.info.clone()]
    }

    fn seek_time(&mut self, time_ms: i64, _backward: bool) -> Result<Option<i64>> {
        // 从目标时刻仍在显示的第一条字幕开始
        self.position = self
            .cues
            .iter()
            .position(|cue| cue.end_ms > time_ms)
            .unwrap_or(self.cues.len());
        Ok(None)
    }

    fn stream_length(&self) -> i64 {
        self.cues.iter().map(|cue| cue.end_ms).max().unwrap_or(0)
    }

    fn caps(&self) -> SourceCaps {
        SourceCaps {
            seekable: true,
            pausable: true,
            realtime: false,
            menu: false,
        }
    }

    fn origin(&self) -> StreamSource {
        StreamSource::Text
    }

    fn description(&self) -> String {
        format!("text-subtitle:{}", self.path.display())
    }
}

/// 从文件名中提取关键词用于模糊匹配
fn extract_keywords(filename: &str) -> Vec<String> {
    const NOISE: [&str; 23] = [
        "web", "dl", "ddp", "atmos", "h264", "h265", "mkv", "mp4", "avi", "1080p", "2160p", "720p",
        "480p", "bluray", "bdrip", "webrip", "x264", "x265", "aac", "ac3", "dts", "flac", "mp3",
    ];
    filename
        .split(['.', '-', '_', ' ', '[', ']', '(', ')'])
        .filter(|part| part.len() > 2)
        .filter(|part| !NOISE.contains(&part.to_lowercase().as_str()))
        .map(str::to_string)
        .collect()
}

/// SRT / VTT 共用的块解析：时间行 + 若干文本行，空行结束
fn parse_blocks(content: &str, parse_timestamp: fn(&str) -> Option<i64>, format: &str) -> Vec<SubtitleCue> {
    let mut cues = Vec::new();
    let mut current: Option<SubtitleCue> = None;

    let mut finish = |current: &mut Option<SubtitleCue>, cues: &mut Vec<SubtitleCue>| {
        if let Some(cue) = current.take() {
            if !cue.text.trim().is_empty() {
                cues.push(SubtitleCue {
                    text: cue.text.trim().to_string(),
                    ..cue
                });
            }
        }
    };

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() {
            finish(&mut current, &mut cues);
            continue;
        }

        if line.contains("-->") {
            let mut parts = line.split("-->").map(str::trim);
            let start = parts.next().and_then(parse_timestamp);
            // VTT 时间行后面可能带位置设置
            let end = parts
                .next()
                .and_then(|s| s.split_whitespace().next())
                .and_then(parse_timestamp);
            match (start, end) {
                (Some(start_ms), Some(end_ms)) => {
                    finish(&mut current, &mut cues);
                    current = Some(SubtitleCue {
                        start_ms,
                        end_ms,
                        text: String::new(),
                    });
                }
                _ => warn!("无法解析 {} 时间行 (第{}行): {}", format, line_num + 1, line),
            }
            continue;
        }

        match current.as_mut() {
            Some(cue) => {
                if !cue.text.is_empty() {
                    cue.text.push('\n');
                }
                cue.text.push_str(line);
            }
            // 序号行、WEBVTT 头、NOTE / STYLE 块
            None => {}
        }
    }
    finish(&mut current, &mut cues);
    cues
}

/// 解析 SRT 格式字幕
fn parse_srt(content: &str) -> Vec<SubtitleCue> {
    let cues = parse_blocks(content, parse_srt_timestamp, "SRT");
    info!("解析 SRT 字幕完成，共 {} 条字幕", cues.len());
    cues
}

/// 解析 WebVTT 格式字幕
fn parse_vtt(content: &str) -> Vec<SubtitleCue> {
    if !content.trim_start().starts_with("WEBVTT") {
        warn!("VTT 文件缺少 WEBVTT 头部");
    }
    let cues = parse_blocks(content, parse_vtt_timestamp, "VTT");
    info!("解析 VTT 字幕完成，共 {} 条字幕", cues.len());
    cues
}

/// 解析 ASS/SSA 格式字幕（只取 [Events] 段的 Dialogue 行）
fn parse_ass(content: &str) -> Vec<SubtitleCue> {
    let mut cues = Vec::new();
    let mut in_events_section = false;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            in_events_section = line.eq_ignore_ascii_case("[Events]");
            continue;
        }
        if in_events_section && line.starts_with("Dialogue:") {
            if let Some(cue) = parse_ass_dialogue_line(line) {
                cues.push(cue);
            }
        }
    }

    info!("解析 ASS 字幕完成，共 {} 条字幕", cues.len());
    cues
}

/// Dialogue: Layer,Start,End,Style,Name,MarginL,MarginR,MarginV,Effect,Text
fn parse_ass_dialogue_line(line: &str) -> Option<SubtitleCue> {
    let parts: Vec<&str> = line.splitn(10, ',').collect();
    if parts.len() < 10 {
        return None;
    }
    let start_ms = parse_ass_timestamp(parts[1].trim())?;
    let end_ms = parse_ass_timestamp(parts[2].trim())?;
    let text = clean_ass_text(parts[9].trim());
    (!text.is_empty()).then_some(SubtitleCue {
        start_ms,
        end_ms,
        text,
    })
}

fn hms_to_ms(hours: &str, minutes: &str, seconds: &str) -> Option<i64> {
    let hours: i64 = hours.parse().ok()?;
    let minutes: i64 = minutes.parse().ok()?;
    let seconds: i64 = seconds.parse().ok()?;
    Some(hours * 3_600_000 + minutes * 60_000 + seconds * 1000)
}

/// 00:01:30,500 -> 90500ms
fn parse_srt_timestamp(timestamp: &str) -> Option<i64> {
    let (time_part, ms_part) = timestamp.split_once(',')?;
    let ms: i64 = ms_part.trim().parse().ok()?;
    let components: Vec<&str> = time_part.split(':').collect();
    match components.as_slice() {
        [h, m, s] => Some(hms_to_ms(h, m, s)? + ms),
        _ => None,
    }
}

/// 0:01:30.50 -> 90500ms（百分之一秒）
fn parse_ass_timestamp(timestamp: &str) -> Option<i64> {
    let (time_part, cs_part) = timestamp.split_once('.')?;
    let centiseconds: i64 = cs_part.parse().ok()?;
    let components: Vec<&str> = time_part.split(':').collect();
    match components.as_slice() {
        [h, m, s] => Some(hms_to_ms(h, m, s)? + centiseconds * 10),
        _ => None,
    }
}

/// 00:01:30.500 或 01:30.500 -> 90500ms
fn parse_vtt_timestamp(timestamp: &str) -> Option<i64> {
    let (time_part, ms_part) = timestamp.split_once('.')?;
    let ms: i64 = ms_part.parse().ok()?;
    let components: Vec<&str> = time_part.split(':').collect();
    match components.as_slice() {
        [m, s] => Some(hms_to_ms("0", m, s)? + ms),
        [h, m, s] => Some(hms_to_ms(h, m, s)? + ms),
        _ => None,
    }
}

/// 去掉 ASS 覆盖标签，\N \n 换行，\h 硬空格
fn clean_ass_text(text: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => in_tag = true,
            '}' => in_tag = false,
            _ if in_tag => {}
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    result.push('\n');
                }
                Some('h') => {
                    chars.next();
                    result.push(' ');
                }
                _ => result.push(ch),
            },
            _ => result.push(ch),
        }
    }

    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRT: &str = "1\n00:00:01,000 --> 00:00:02,500\nHello\nWorld\n\n2\n00:00:03,000 --> 00:00:04,000\nSecond\n";

    #[test]
    fn test_parse_timestamps() {
        assert_eq!(parse_srt_timestamp("00:01:30,500"), Some(90500));
        assert_eq!(parse_srt_timestamp("01:23:45,123"), Some(5025123));
        assert_eq!(parse_ass_timestamp("0:01:30.50"), Some(90500));
        assert_eq!(parse_vtt_timestamp("01:30.500"), Some(90500));
        assert_eq!(parse_vtt_timestamp("00:01:30.500"), Some(90500));
        assert_eq!(parse_srt_timestamp("bogus"), None);
    }

    #[test]
    fn test_clean_ass_text() {
        assert_eq!(clean_ass_text("{\\b1}Hello{\\b0} World"), "Hello World");
        assert_eq!(clean_ass_text("Line 1\\NLine 2"), "Line 1\nLine 2");
        assert_eq!(clean_ass_text("{\\an8}Top\\hline"), "Top line");
    }

    #[test]
    fn test_srt_source_packets() {
        let mut source = TextSubtitleSource::from_content(SRT, "srt").unwrap();
        assert_eq!(source.cues().len(), 2);

        let first = source.read_packet().unwrap().unwrap();
        assert_eq!(first.pts, Some(1_000_000));
        assert_eq!(first.duration, Some(1_500_000));
        assert_eq!(first.data, b"Hello\nWorld".to_vec());

        source.read_packet().unwrap().unwrap();
        assert!(source.read_packet().unwrap().is_none());
        assert_eq!(source.stream_length(), 4000);
        assert_eq!(source.origin(), StreamSource::Text);
    }

    #[test]
    fn test_seek_restarts_at_visible_cue() {
        let mut source = TextSubtitleSource::from_content(SRT, "srt").unwrap();
        source.seek_time(2000, false).unwrap();
        assert_eq!(source.read_packet().unwrap().unwrap().pts, Some(1_000_000));
        source.seek_time(2600, false).unwrap();
        assert_eq!(source.read_packet().unwrap().unwrap().pts, Some(3_000_000));
    }

    #[test]
    fn test_vtt_and_ass() {
        let vtt = "WEBVTT\n\nNOTE comment\n\n00:01.000 --> 00:02.000 align:start\nHi there\n";
        let source = TextSubtitleSource::from_content(vtt, "vtt").unwrap();
        assert_eq!(
            source.cues(),
            &[SubtitleCue {
                start_ms: 1000,
                end_ms: 2000,
                text: "Hi there".to_string()
            }]
        );

        let ass = "[Script Info]\nTitle: x\n\n[Events]\nFormat: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\nDialogue: 0,0:00:05.00,0:00:06.50,Default,,0,0,0,,{\\i1}Hi, you{\\i0}\n";
        let source = TextSubtitleSource::from_content(ass, "ass").unwrap();
        assert_eq!(source.cues()[0].start_ms, 5000);
        assert_eq!(source.cues()[0].text, "Hi, you");

        assert!(TextSubtitleSource::from_content("", "sub").is_err());
    }

    #[test]
    fn test_language_from_filename() {
        assert_eq!(
            TextSubtitleSource::language_from_filename(Path::new("/m/movie.fra.srt")),
            Some("fra".to_string())
        );
        assert_eq!(
            TextSubtitleSource::language_from_filename(Path::new("/m/movie.srt")),
            None
        );
    }

    #[test]
    fn test_find_sidecar_files() {
        let dir = std::env::temp_dir().join(format!("sidecar-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for name in ["Some.Movie.2020.mkv", "Some.Movie.2020.srt", "Some.Movie.2020.en.vtt", "other.srt"] {
            fs::write(dir.join(name), "").unwrap();
        }

        let found = TextSubtitleSource::find_sidecar_files(&dir.join("Some.Movie.2020.mkv"));
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["Some.Movie.2020.srt", "Some.Movie.2020.en.vtt"]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
