//! SVG Charts for Training History
//!
//! Renders the per-epoch loss, accuracy and recall of a training run to a
//! standalone SVG file.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::error::Result;
use crate::utils::metrics::TrainingHistory;

const COLOR_LOSS: &str = "#c0392b";
const COLOR_ACCURACY: &str = "#2980b9";
const COLOR_RECALL: &str = "#27ae60";
const INK: &str = "#34495e";
const GRID: &str = "#e5e8ea";
const FONT: &str = "Helvetica, Arial, sans-serif";

/// Canvas size and the plot area inside it
#[derive(Debug, Clone, Copy)]
struct Frame {
    width: f64,
    height: f64,
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
}

impl Frame {
    const DEFAULT: Frame = Frame {
        width: 760.0,
        height: 480.0,
        left: 70.0,
        top: 56.0,
        right: 130.0,
        bottom: 64.0,
    };

    fn plot_width(&self) -> f64 {
        self.width - self.left - self.right
    }

    fn plot_height(&self) -> f64 {
        self.height - self.top - self.bottom
    }

    fn baseline(&self) -> f64 {
        self.top + self.plot_height()
    }
}

/// Data-to-canvas mapping; degenerate ranges map to the middle of the plot
struct Scale {
    frame: Frame,
    x: (f64, f64),
    y: (f64, f64),
}

impl Scale {
    fn fit(frame: Frame, series: &[DataSeries]) -> Self {
        let points = || series.iter().flat_map(|s| s.points.iter());
        let bounds = |get: fn(&DataPoint) -> f64| {
            points().map(get).fold(None, |acc: Option<(f64, f64)>, v| {
                Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
            })
        };
        let x = bounds(|p| p.x).unwrap_or((0.0, 1.0));
        let (y_lo, y_hi) = bounds(|p| p.y).unwrap_or((0.0, 1.0));
        // Metrics are non-negative; start the axis at zero
        let y = (y_lo.min(0.0), y_hi.max(y_lo.min(0.0) + f64::EPSILON));
        Self { frame, x, y }
    }

    fn unit(value: f64, (lo, hi): (f64, f64)) -> f64 {
        if hi > lo {
            (value - lo) / (hi - lo)
        } else {
            0.5
        }
    }

    fn px(&self, x: f64) -> f64 {
        self.frame.left + Self::unit(x, self.x) * self.frame.plot_width()
    }

    fn py(&self, y: f64) -> f64 {
        self.frame.baseline() - Self::unit(y, self.y) * self.frame.plot_height()
    }
}

/// Receives the accumulated history once training finishes
pub trait Visualizer {
    fn render(&self, history: &TrainingHistory) -> Result<()>;
}

/// Writes the history as a line chart with one series per metric
#[derive(Debug, Clone)]
pub struct SvgChartVisualizer {
    output_path: PathBuf,
    title: String,
}

impl SvgChartVisualizer {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            title: "Training History".to_string(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl Visualizer for SvgChartVisualizer {
    fn render(&self, history: &TrainingHistory) -> Result<()> {
        let series = history_series(history);
        generate_line_chart(&self.title, "Epoch", "Value", &series, &self.output_path)?;
        tracing::info!("Training chart written to {:?}", self.output_path);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub x: f64,
    pub y: f64,
}

/// One named line of the chart
#[derive(Debug, Clone)]
pub struct DataSeries {
    pub name: String,
    pub points: Vec<DataPoint>,
    pub color: String,
}

/// Loss, accuracy and recall series, epochs numbered from 1
///
/// Epochs with undefined recall are left out of the recall series.
pub fn history_series(history: &TrainingHistory) -> Vec<DataSeries> {
    let indexed = |values: Vec<Option<f64>>| -> Vec<DataPoint> {
        values
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|y| DataPoint { x: (i + 1) as f64, y }))
            .collect()
    };

    vec![
        DataSeries {
            name: "Loss".to_string(),
            points: indexed(history.losses().into_iter().map(Some).collect()),
            color: COLOR_LOSS.to_string(),
        },
        DataSeries {
            name: "Accuracy".to_string(),
            points: indexed(history.accuracies().into_iter().map(Some).collect()),
            color: COLOR_ACCURACY.to_string(),
        },
        DataSeries {
            name: "Recall".to_string(),
            points: indexed(history.recalls()),
            color: COLOR_RECALL.to_string(),
        },
    ]
}

/// Render `series` and write the SVG to `output_path`
pub fn generate_line_chart(
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[DataSeries],
    output_path: &Path,
) -> std::io::Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_path, render_line_chart(title, x_label, y_label, series))
}

/// Build the SVG document for a line chart
pub fn render_line_chart(
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[DataSeries],
) -> String {
    let frame = Frame::DEFAULT;
    let scale = Scale::fit(frame, series);
    let mut svg = String::new();

    // `write!` into a String cannot fail
    let _ = write!(
        svg,
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}"><rect width="100%" height="100%" fill="#fff"/>"##,
        w = frame.width,
        h = frame.height
    );
    text(&mut svg, frame.width / 2.0, 32.0, 17, "middle", title, "");

    const TICKS: usize = 4;
    for tick in 0..=TICKS {
        let value = scale.y.0 + (scale.y.1 - scale.y.0) * tick as f64 / TICKS as f64;
        let y = scale.py(value);
        line(&mut svg, (frame.left, y), (frame.left + frame.plot_width(), y), GRID, 1.0);
        text(&mut svg, frame.left - 8.0, y + 4.0, 11, "end", &format!("{:.2}", value), "");
    }

    line(
        &mut svg,
        (frame.left, frame.top),
        (frame.left, frame.baseline()),
        INK,
        1.5,
    );
    line(
        &mut svg,
        (frame.left, frame.baseline()),
        (frame.left + frame.plot_width(), frame.baseline()),
        INK,
        1.5,
    );
    text(
        &mut svg,
        frame.left + frame.plot_width() / 2.0,
        frame.height - 18.0,
        13,
        "middle",
        x_label,
        "",
    );
    let mid = frame.top + frame.plot_height() / 2.0;
    text(
        &mut svg,
        22.0,
        mid,
        13,
        "middle",
        y_label,
        &format!(r#" transform="rotate(-90 22 {})""#, mid),
    );

    if let Some(longest) = series.iter().max_by_key(|s| s.points.len()) {
        for p in &longest.points {
            let label = format!("{}", p.x);
            text(&mut svg, scale.px(p.x), frame.baseline() + 18.0, 11, "middle", &label, "");
        }
    }

    for data in series.iter().filter(|s| !s.points.is_empty()) {
        let mut d = String::new();
        for (i, p) in data.points.iter().enumerate() {
            let _ = write!(
                d,
                "{}{:.2},{:.2}",
                if i == 0 { "M" } else { " L" },
                scale.px(p.x),
                scale.py(p.y)
            );
        }
        let _ = write!(
            svg,
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="2.5"/>"#,
            d, data.color
        );
        for p in &data.points {
            let _ = write!(
                svg,
                r#"<circle cx="{:.2}" cy="{:.2}" r="4" fill="{}"/>"#,
                scale.px(p.x),
                scale.py(p.y),
                data.color
            );
        }
    }

    let legend_x = frame.left + frame.plot_width() + 16.0;
    for (i, data) in series.iter().enumerate() {
        let y = frame.top + 8.0 + i as f64 * 22.0;
        line(&mut svg, (legend_x, y), (legend_x + 18.0, y), &data.color, 3.0);
        text(&mut svg, legend_x + 24.0, y + 4.0, 12, "start", &data.name, "");
    }

    svg.push_str("</svg>");
    svg
}

fn line(svg: &mut String, from: (f64, f64), to: (f64, f64), color: &str, width: f64) {
    let _ = write!(
        svg,
        r#"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="{}" stroke-width="{}"/>"#,
        from.0, from.1, to.0, to.1, color, width
    );
}

fn text(svg: &mut String, x: f64, y: f64, size: u32, anchor: &str, content: &str, extra: &str) {
    let _ = write!(
        svg,
        r#"<text x="{:.2}" y="{:.2}" font-family="{}" font-size="{}" text-anchor="{}" fill="{}"{}>{}</text>"#,
        x,
        y,
        FONT,
        size,
        anchor,
        INK,
        extra,
        escape_xml(content)
    );
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::metrics::EpochStats;
    use tempfile::TempDir;

    fn history() -> TrainingHistory {
        let mut history = TrainingHistory::new();
        for (loss, recall) in [(0.9, None), (0.6, Some(0.5)), (0.3, Some(0.75))] {
            history.push(EpochStats {
                loss,
                accuracy: 1.0 - loss,
                recall,
                samples: 8,
            });
        }
        history
    }

    #[test]
    fn test_history_series_skips_undefined_recall() {
        let series = history_series(&history());
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].points.len(), 3);
        assert_eq!(series[2].points.len(), 2);
        assert_eq!(series[2].points[0].x, 2.0);
    }

    #[test]
    fn test_render_escapes_title() {
        let svg = render_line_chart("Loss & <Acc>", "Epoch", "Value", &history_series(&history()));
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("Loss &amp; &lt;Acc&gt;"));
        assert!(!svg.contains("NaN"));
    }

    #[test]
    fn test_single_epoch_has_no_nan() {
        let mut single = TrainingHistory::new();
        single.push(EpochStats {
            loss: 0.5,
            accuracy: 0.5,
            recall: Some(1.0),
            samples: 2,
        });
        let svg = render_line_chart("t", "x", "y", &history_series(&single));
        assert!(!svg.contains("NaN"));
    }

    #[test]
    fn test_visualizer_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.svg");

        SvgChartVisualizer::new(&path).render(&history()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Recall"));
    }

    #[test]
    fn test_visualizer_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("charts").join("history.svg");

        SvgChartVisualizer::new(&path).render(&history()).unwrap();

        assert!(path.exists());
    }
}
