//! 默认选流规则
//!
//! 每个比较函数都是全序：最后以类型内序号决胜，流表不变时重复选择结果稳定。

use crate::core::{PlayerSettings, StreamSource};
use crate::player::registry::SelectionStream;
use std::cmp::Ordering;

/// 特殊语言设置：优先原始语言
pub const LANG_ORIGINAL: &str = "original";
/// 特殊语言设置：完全按媒体自带的 default 标志
pub const LANG_MEDIA_DEFAULT: &str = "mediadefault";
/// 字幕：不自动选择
pub const LANG_NONE: &str = "none";
/// 字幕：只要与音轨同语言的强制字幕
pub const LANG_FORCED_ONLY: &str = "forced_only";

const LANGUAGE_CODES: &[&[&str]] = &[
    &["en", "eng"],
    &["fr", "fra", "fre"],
    &["de", "deu", "ger"],
    &["es", "spa"],
    &["it", "ita"],
    &["ja", "jpn"],
    &["zh", "zho", "chi"],
    &["ko", "kor"],
    &["ru", "rus"],
    &["pt", "por"],
    &["nl", "nld", "dut"],
];

/// 归一化语言代码：去掉地区后缀，ISO 639-1 / 639-2 映射到同一个代码
fn normalize_language(language: &str) -> String {
    let base = language
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|codes| codes.contains(&base.as_str()))
        .map(|codes| codes[0].to_string())
        .unwrap_or(base)
}

/// 两个语言代码是否指同一种语言（空代码不匹配任何语言）
pub fn lang_matches(preferred: &str, language: &str) -> bool {
    if preferred.is_empty() || language.is_empty() {
        return false;
    }
    normalize_language(preferred) == normalize_language(language)
}

/// 音频编码优先级，越大越好
pub fn codec_priority(codec: &str) -> u8 {
    match codec.to_ascii_lowercase().as_str() {
        "flac" => 7,
        "truehd" => 6,
        "dtshd_ma" => 5,
        "dtshd_hra" => 4,
        "eac3" => 3,
        "dca" => 2,
        "ac3" => 1,
        _ => 0,
    }
}

/// true 排在前面
fn prefer(a: bool, b: bool) -> Ordering {
    b.cmp(&a)
}

fn is_previous(stream: &SelectionStream, previous: Option<(StreamSource, i32)>) -> bool {
    previous.map_or(false, |(source, id)| stream.source == source && stream.id == id)
}

/// 音轨排序
pub struct AudioRanking<'a> {
    /// 之前选中的流（切换数据源 / 重新选择时保留用户选择）
    pub previous: Option<(StreamSource, i32)>,
    pub settings: &'a PlayerSettings,
}

impl<'a> AudioRanking<'a> {
    pub fn new(settings: &'a PlayerSettings, previous: Option<(StreamSource, i32)>) -> Self {
        Self { previous, settings }
    }

    pub fn compare(&self, a: &SelectionStream, b: &SelectionStream) -> Ordering {
        let settings = self.settings;
        let preferred = settings.audio_language.as_str();
        let media_default = preferred == LANG_MEDIA_DEFAULT;

        prefer(is_previous(a, self.previous), is_previous(b, self.previous))
            .then_with(|| {
                if media_default {
                    Ordering::Equal
                } else if preferred == LANG_ORIGINAL {
                    prefer(a.flags.original, b.flags.original)
                } else {
                    prefer(lang_matches(preferred, &a.language), lang_matches(preferred, &b.language))
                }
            })
            .then_with(|| {
                if media_default {
                    return Ordering::Equal;
                }
                let wanted = settings.accessibility.audio_hearing;
                prefer(a.flags.hearing_impaired == wanted, b.flags.hearing_impaired == wanted)
            })
            .then_with(|| {
                if media_default {
                    return Ordering::Equal;
                }
                let wanted = settings.accessibility.audio_visual;
                prefer(a.flags.visual_impaired == wanted, b.flags.visual_impaired == wanted)
            })
            .then_with(|| {
                if settings.prefer_default_flag {
                    prefer(a.flags.default, b.flags.default)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| {
                if settings.prefer_stereo {
                    prefer(a.channels == 2, b.channels == 2)
                } else {
                    b.channels.cmp(&a.channels)
                }
            })
            .then_with(|| codec_priority(&b.codec).cmp(&codec_priority(&a.codec)))
            .then_with(|| prefer(a.flags.default, b.flags.default))
            .then_with(|| a.type_index.cmp(&b.type_index))
    }
}

/// 字幕过滤 + 排序
pub struct SubtitleRanking<'a> {
    pub previous: Option<(StreamSource, i32)>,
    /// 当前音轨的语言
    pub audio_language: String,
    pub settings: &'a PlayerSettings,
}

impl<'a> SubtitleRanking<'a> {
    pub fn new(
        settings: &'a PlayerSettings,
        previous: Option<(StreamSource, i32)>,
        audio_language: &str,
    ) -> Self {
        Self {
            previous,
            audio_language: audio_language.to_string(),
            settings,
        }
    }

    fn preferred_language(&self) -> &str {
        match self.settings.subtitle_language.as_str() {
            LANG_ORIGINAL | LANG_NONE | LANG_FORCED_ONLY | LANG_MEDIA_DEFAULT => &self.audio_language,
            language => language,
        }
    }

    fn forced_matching_audio(&self, stream: &SelectionStream) -> bool {
        stream.flags.forced && lang_matches(&self.audio_language, &stream.language)
    }

    /// 是否值得考虑（不相关的流排在最后，且选中后不显示）
    pub fn is_relevant(&self, stream: &SelectionStream) -> bool {
        if is_previous(stream, self.previous) {
            return true;
        }
        match self.settings.subtitle_language.as_str() {
            LANG_NONE => false,
            LANG_FORCED_ONLY => self.forced_matching_audio(stream),
            mode => {
                stream.source.is_external()
                    || (stream.flags.forced
                        && (mode == LANG_ORIGINAL || self.forced_matching_audio(stream)))
                    || stream.flags.default
                    || lang_matches(self.preferred_language(), &stream.language)
            }
        }
    }

    pub fn compare(&self, a: &SelectionStream, b: &SelectionStream) -> Ordering {
        let preferred = self.preferred_language();
        let hearing = self.settings.accessibility.subtitle_hearing;

        prefer(self.is_relevant(a), self.is_relevant(b))
            .then_with(|| prefer(is_previous(a, self.previous), is_previous(b, self.previous)))
            .then_with(|| prefer(a.source.is_external(), b.source.is_external()))
            .then_with(|| prefer(self.forced_matching_audio(a), self.forced_matching_audio(b)))
            .then_with(|| prefer(a.flags.forced, b.flags.forced))
            .then_with(|| prefer(lang_matches(preferred, &a.language), lang_matches(preferred, &b.language)))
            .then_with(|| prefer(a.flags.hearing_impaired == hearing, b.flags.hearing_impaired == hearing))
            .then_with(|| prefer(a.flags.default, b.flags.default))
            .then_with(|| a.type_index.cmp(&b.type_index))
    }

    /// 选中 `winner` 之后字幕是否显示
    pub fn visible(&self, winner: &SelectionStream) -> bool {
        if !self.is_relevant(winner) {
            return false;
        }
        winner.flags.forced || self.settings.subtitles_on
    }
}

/// 视频：default 标志优先，其次按出现顺序
pub fn compare_video(a: &SelectionStream, b: &SelectionStream) -> Ordering {
    prefer(a.flags.default, b.flags.default).then_with(|| a.type_index.cmp(&b.type_index))
}

/// 图文电视 / 数据广播：按出现顺序
pub fn compare_by_index(a: &SelectionStream, b: &SelectionStream) -> Ordering {
    a.type_index.cmp(&b.type_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StreamFlags, StreamType};
    use crate::player::registry::SelectionStreams;

    fn audio(id: i32, language: &str) -> SelectionStream {
        SelectionStream {
            stream_type: StreamType::Audio,
            source: StreamSource::Demux,
            id,
            type_index: 0,
            language: language.to_string(),
            name: String::new(),
            codec: "aac".to_string(),
            channels: 2,
            width: 0,
            height: 0,
            flags: StreamFlags::default(),
            filename: None,
            valid: true,
        }
    }

    fn subtitle(source: StreamSource, id: i32, language: &str) -> SelectionStream {
        SelectionStream {
            stream_type: StreamType::Subtitle,
            source,
            ..audio(id, language)
        }
    }

    #[test]
    fn test_preferred_language_beats_default_flag() {
        let mut registry = SelectionStreams::new();
        let mut english = audio(0, "eng");
        english.flags.default = true;
        registry.update(english);
        registry.update(audio(1, "fra"));

        let settings = PlayerSettings {
            audio_language: "fra".to_string(),
            ..Default::default()
        };
        let ranking = AudioRanking::new(&settings, None);
        let sorted = registry.get_sorted(StreamType::Audio, |a, b| ranking.compare(a, b));
        assert_eq!(sorted[0].id, 1);
        assert_eq!(sorted[1].id, 0);
    }

    #[test]
    fn test_previous_selection_wins() {
        let mut registry = SelectionStreams::new();
        registry.update(audio(0, "fra"));
        registry.update(audio(1, "eng"));
        let settings = PlayerSettings {
            audio_language: "fr".to_string(),
            ..Default::default()
        };
        let ranking = AudioRanking::new(&settings, Some((StreamSource::Demux, 1)));
        let sorted = registry.get_sorted(StreamType::Audio, |a, b| ranking.compare(a, b));
        assert_eq!(sorted[0].id, 1);
    }

    #[test]
    fn test_audio_ranking_is_total_order() {
        let mut candidates = Vec::new();
        let codecs = ["ac3", "flac", "aac", "truehd"];
        let languages = ["eng", "fra", "", "de"];
        for i in 0..16 {
            let mut stream = audio(i, languages[i as usize % 4]);
            stream.type_index = i as usize;
            stream.codec = codecs[(i as usize / 4) % 4].to_string();
            stream.channels = if i % 3 == 0 { 6 } else { 2 };
            stream.flags.default = i % 5 == 0;
            stream.flags.hearing_impaired = i % 7 == 0;
            stream.flags.original = i % 2 == 0;
            candidates.push(stream);
        }

        for audio_language in ["eng", LANG_ORIGINAL, LANG_MEDIA_DEFAULT] {
            let settings = PlayerSettings {
                audio_language: audio_language.to_string(),
                ..Default::default()
            };
            let ranking = AudioRanking::new(&settings, Some((StreamSource::Demux, 9)));
            for a in &candidates {
                for b in &candidates {
                    let ab = ranking.compare(a, b);
                    let ba = ranking.compare(b, a);
                    assert_eq!(ab, ba.reverse());
                    if a.type_index != b.type_index {
                        assert_ne!(ab, Ordering::Equal);
                    }
                    for c in &candidates {
                        if ab == Ordering::Less && ranking.compare(b, c) == Ordering::Less {
                            assert_eq!(ranking.compare(a, c), Ordering::Less);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_codec_and_channels() {
        let settings = PlayerSettings::default();
        let ranking = AudioRanking::new(&settings, None);
        let mut stereo_flac = audio(0, "eng");
        stereo_flac.codec = "flac".to_string();
        let mut surround_ac3 = audio(1, "eng");
        surround_ac3.channels = 6;
        surround_ac3.codec = "ac3".to_string();
        surround_ac3.type_index = 1;
        assert_eq!(ranking.compare(&surround_ac3, &stereo_flac), Ordering::Less);

        let stereo = PlayerSettings {
            prefer_stereo: true,
            ..Default::default()
        };
        let ranking = AudioRanking::new(&stereo, None);
        assert_eq!(ranking.compare(&stereo_flac, &surround_ac3), Ordering::Less);
    }

    #[test]
    fn test_hearing_impaired_inverted_when_setting_off() {
        let mut settings = PlayerSettings::default();
        let mut hi = audio(0, "eng");
        hi.flags.hearing_impaired = true;
        let mut plain = audio(1, "eng");
        plain.type_index = 1;

        assert_eq!(AudioRanking::new(&settings, None).compare(&plain, &hi), Ordering::Less);
        settings.accessibility.audio_hearing = true;
        assert_eq!(AudioRanking::new(&settings, None).compare(&hi, &plain), Ordering::Less);
    }

    #[test]
    fn test_subtitle_filter_and_visibility() {
        let settings = PlayerSettings {
            subtitle_language: "eng".to_string(),
            subtitles_on: false,
            ..Default::default()
        };
        let ranking = SubtitleRanking::new(&settings, None, "fra");

        let mut german = subtitle(StreamSource::Demux, 0, "deu");
        german.type_index = 0;
        let mut english = subtitle(StreamSource::Demux, 1, "eng");
        english.type_index = 1;
        let mut forced_french = subtitle(StreamSource::Demux, 2, "fra");
        forced_french.type_index = 2;
        forced_french.flags.forced = true;
        let mut external = subtitle(StreamSource::Text, 0, "");
        external.type_index = 3;

        assert!(!ranking.is_relevant(&german));
        assert!(ranking.is_relevant(&english));
        assert!(ranking.is_relevant(&forced_french));

        let mut all = vec![german.clone(), english.clone(), forced_french.clone(), external.clone()];
        all.sort_by(|a, b| ranking.compare(a, b));
        let order: Vec<(StreamSource, i32)> = all.iter().map(|s| (s.source, s.id)).collect();
        assert_eq!(
            order,
            vec![
                (StreamSource::Text, 0),
                (StreamSource::Demux, 2),
                (StreamSource::Demux, 1),
                (StreamSource::Demux, 0),
            ]
        );

        // 强制字幕总是显示，其余看用户开关
        assert!(ranking.visible(&forced_french));
        assert!(!ranking.visible(&english));
        assert!(!ranking.visible(&german));
    }

    #[test]
    fn test_subtitle_none_and_forced_only() {
        let mut forced = subtitle(StreamSource::Demux, 0, "eng");
        forced.flags.forced = true;
        let mut default = subtitle(StreamSource::Demux, 1, "eng");
        default.flags.default = true;
        default.type_index = 1;

        let none = PlayerSettings {
            subtitle_language: LANG_NONE.to_string(),
            ..Default::default()
        };
        let ranking = SubtitleRanking::new(&none, Some((StreamSource::Demux, 1)), "eng");
        assert!(!ranking.is_relevant(&forced));
        assert!(ranking.is_relevant(&default));

        let forced_only = PlayerSettings {
            subtitle_language: LANG_FORCED_ONLY.to_string(),
            ..Default::default()
        };
        let ranking = SubtitleRanking::new(&forced_only, None, "en");
        assert!(ranking.is_relevant(&forced));
        assert!(!ranking.is_relevant(&default));
    }

    #[test]
    fn test_video_default_flag() {
        let mut first = audio(0, "");
        first.stream_type = StreamType::Video;
        let mut second = first.clone();
        second.id = 1;
        second.type_index = 1;
        second.flags.default = true;
        assert_eq!(compare_video(&second, &first), Ordering::Less);
        assert_eq!(compare_by_index(&first, &second), Ordering::Less);
    }

    #[test]
    fn test_lang_matches() {
        assert!(lang_matches("fr", "fre"));
        assert!(lang_matches("FRA", "fr-CA"));
        assert!(lang_matches("ger", "de"));
        assert!(!lang_matches("eng", "fra"));
        assert!(!lang_matches("", ""));
        assert!(lang_matches("sv", "SV"));
    }
}
