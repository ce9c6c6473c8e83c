//! Turns timed transcript segments into positioned caption overlays.
//!
//! Output depends only on the segments, the style, the frame size and the
//! render configuration. All geometry is integer pixel math over the built-in
//! font metrics, so identical inputs give byte-identical overlay tracks.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::overlay::{Highlight, Overlay, OverlayLine, OverlayTrack};
use crate::models::style::{CaptionPosition, CaptionStyle};
use crate::models::transcript::Segment;
use crate::services::font_metrics::text_width;

const ELLIPSIS: char = '\u{2026}';

/// What happens to lines beyond `max_lines`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OverflowPolicy {
    /// Keep the first `max_lines` lines and end the last one with an ellipsis.
    #[default]
    Truncate,
    /// Show the segment as consecutive pages of at most `max_lines` lines.
    Paginate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Share of the frame width available to a caption box.
    pub max_width_ratio: f64,
    pub max_lines: usize,
    pub overflow: OverflowPolicy,
    pub highlight_words: bool,
    pub highlight_color: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_width_ratio: 0.8,
            max_lines: 2,
            overflow: OverflowPolicy::Truncate,
            highlight_words: false,
            highlight_color: "#FFFF00".to_string(),
        }
    }
}

struct Token<'a> {
    text: &'a str,
    start_ms: Option<u64>,
}

/// A run of lines shown together over one time range.
struct Page {
    lines: Vec<Vec<usize>>,
    start_ms: u64,
    end_ms: u64,
    truncated: bool,
}

pub struct CaptionRenderer {
    config: RenderConfig,
}

impl CaptionRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn render(
        &self,
        segments: &[Segment],
        style: &CaptionStyle,
        width: u32,
        height: u32,
    ) -> OverlayTrack {
        let style = style.normalized();
        let max_line_width = ((width as f64 * self.config.max_width_ratio).floor() as u32)
            .saturating_sub(2 * style.padding)
            .max(1);

        let mut overlays = Vec::new();
        for segment in segments {
            let tokens = self.tokens(segment);
            if tokens.is_empty() || segment.end_ms <= segment.start_ms {
                continue;
            }
            let lines = wrap(&tokens, &style, max_line_width);
            for page in self.paginate(segment, &tokens, lines) {
                self.emit(&page, &tokens, &style, width, height, &mut overlays);
            }
        }

        OverlayTrack {
            width,
            height,
            overlays,
        }
    }

    fn tokens<'a>(&self, segment: &'a Segment) -> Vec<Token<'a>> {
        match &segment.words {
            Some(words) if self.config.highlight_words => words
                .iter()
                .map(|w| Token {
                    text: w.text.as_str(),
                    start_ms: Some(w.start_ms),
                })
                .collect(),
            _ => segment
                .text
                .split_whitespace()
                .map(|text| Token {
                    text,
                    start_ms: None,
                })
                .collect(),
        }
    }

    fn paginate(&self, segment: &Segment, tokens: &[Token], mut lines: Vec<Vec<usize>>) -> Vec<Page> {
        let max_lines = self.config.max_lines.max(1);
        if lines.len() <= max_lines {
            return vec![Page {
                lines,
                start_ms: segment.start_ms,
                end_ms: segment.end_ms,
                truncated: false,
            }];
        }

        match self.config.overflow {
            OverflowPolicy::Truncate => {
                tracing::debug!(
                    dropped_lines = lines.len() - max_lines,
                    start_ms = segment.start_ms,
                    "Truncating caption"
                );
                lines.truncate(max_lines);
                vec![Page {
                    lines,
                    start_ms: segment.start_ms,
                    end_ms: segment.end_ms,
                    truncated: true,
                }]
            }
            OverflowPolicy::Paginate => {
                let total = tokens.len() as u64;
                let duration = segment.end_ms - segment.start_ms;
                let chunks: Vec<Vec<Vec<usize>>> =
                    lines.chunks(max_lines).map(<[_]>::to_vec).collect();

                let mut starts = Vec::with_capacity(chunks.len());
                let mut previous = segment.start_ms;
                for (i, chunk) in chunks.iter().enumerate() {
                    let start = if i == 0 {
                        segment.start_ms
                    } else {
                        let first = chunk[0][0];
                        tokens[first]
                            .start_ms
                            .unwrap_or(segment.start_ms + duration * first as u64 / total)
                    };
                    previous = start.clamp(previous, segment.end_ms);
                    starts.push(previous);
                }

                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, lines)| Page {
                        lines,
                        start_ms: starts[i],
                        end_ms: starts.get(i + 1).copied().unwrap_or(segment.end_ms),
                        truncated: false,
                    })
                    .filter(|page| page.end_ms > page.start_ms)
                    .collect()
            }
        }
    }

    fn emit(
        &self,
        page: &Page,
        tokens: &[Token],
        style: &CaptionStyle,
        width: u32,
        height: u32,
        overlays: &mut Vec<Overlay>,
    ) {
        let mut texts: Vec<String> = page
            .lines
            .iter()
            .map(|line| join(tokens, line))
            .collect();
        if page.truncated {
            if let Some(last) = texts.last_mut() {
                last.push(ELLIPSIS);
            }
        }

        let line_height = style.font_size + 4;
        let widths: Vec<u32> = texts
            .iter()
            .map(|t| text_width(t, style.font_family, style.font_size))
            .collect();
        let box_width = widths.iter().copied().max().unwrap_or(0) + 2 * style.padding;
        let box_height = texts.len() as u32 * line_height + 2 * style.padding;

        let frame_w = width as i32;
        let frame_h = height as i32;
        let box_x = (frame_w - box_width as i32) / 2;
        let box_y = match style.position {
            CaptionPosition::Top => style.padding as i32,
            CaptionPosition::Center => (frame_h - box_height as i32) / 2,
            CaptionPosition::Bottom => frame_h - box_height as i32 - style.padding as i32,
        };

        let lines: Vec<OverlayLine> = texts
            .into_iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (text, &w))| OverlayLine {
                text,
                x: (frame_w - w as i32) / 2,
                y: box_y + style.padding as i32 + (i as u32 * line_height) as i32,
                width: w,
            })
            .collect();

        let base = Overlay {
            start_ms: page.start_ms,
            end_ms: page.end_ms,
            x: box_x,
            y: box_y,
            box_width,
            box_height,
            font_family: style.font_family,
            font_size: style.font_size,
            line_height,
            fill: style.font_color.clone(),
            stroke: style.stroke_color.clone(),
            stroke_width: style.stroke_width,
            lines,
            highlight: None,
        };

        let timed = tokens.iter().all(|t| t.start_ms.is_some());
        if !(self.config.highlight_words && timed) {
            overlays.push(base);
            return;
        }

        // (line, word-in-line, token) in reading order.
        let placed: Vec<(usize, usize, usize)> = page
            .lines
            .iter()
            .enumerate()
            .flat_map(|(l, line)| line.iter().enumerate().map(move |(w, &t)| (l, w, t)))
            .collect();

        let first_start = placed
            .first()
            .and_then(|&(_, _, t)| tokens[t].start_ms)
            .unwrap_or(page.start_ms)
            .clamp(page.start_ms, page.end_ms);
        if first_start > page.start_ms {
            overlays.push(Overlay {
                end_ms: first_start,
                ..base.clone()
            });
        }

        for (i, &(line, word, token)) in placed.iter().enumerate() {
            let start = tokens[token]
                .start_ms
                .unwrap_or(page.start_ms)
                .clamp(page.start_ms, page.end_ms);
            let end = placed
                .get(i + 1)
                .and_then(|&(_, _, next)| tokens[next].start_ms)
                .unwrap_or(page.end_ms)
                .clamp(start, page.end_ms);
            if end <= start {
                continue;
            }

            let line_tokens = &page.lines[line];
            let prefix = if word == 0 {
                0
            } else {
                let before = join(tokens, &line_tokens[..word]) + " ";
                text_width(&before, style.font_family, style.font_size)
            };
            let text = tokens[token].text.to_string();
            let word_width = text_width(&text, style.font_family, style.font_size);

            overlays.push(Overlay {
                start_ms: start,
                end_ms: end,
                highlight: Some(Highlight {
                    line,
                    word,
                    x: base.lines[line].x + prefix as i32,
                    width: word_width,
                    text,
                    fill: self.config.highlight_color.to_ascii_uppercase(),
                }),
                ..base.clone()
            });
        }
    }
}

fn join(tokens: &[Token], indices: &[usize]) -> String {
    indices
        .iter()
        .map(|&i| tokens[i].text)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Greedy wrap. A word wider than the line sits on a line of its own.
fn wrap(tokens: &[Token], style: &CaptionStyle, max_width: u32) -> Vec<Vec<usize>> {
    let mut lines: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_text = String::new();

    for (i, token) in tokens.iter().enumerate() {
        let candidate = if current.is_empty() {
            token.text.to_string()
        } else {
            format!("{} {}", current_text, token.text)
        };
        if current.is_empty()
            || text_width(&candidate, style.font_family, style.font_size) <= max_width
        {
            current.push(i);
            current_text = candidate;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push(i);
            current_text = token.text.to_string();
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
