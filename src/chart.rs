use crate::error::ReportError;
use crate::metric::{ChartImage, MetricDescriptor, MetricSeries};
use plotters::prelude::*;
use std::fmt::Display;
use std::ops::Range;

const MIN_SIDE: u32 = 16;
/// GetMetricWidgetImage accepts at most 2000 px per side.
pub const MAX_SIDE: u32 = 2000;
const LINE: RGBColor = RGBColor(31, 119, 180);
const GRID: RGBColor = RGBColor(225, 225, 225);
const PLACEHOLDER: RGBColor = RGBColor(242, 242, 242);
const BORDER: RGBColor = RGBColor(190, 190, 190);
const GRID_LINES: usize = 4;

/// Draws metric series as PNG line charts. Titles and axis labels live in the
/// workbook cells around the image, so no text is drawn here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartRenderer {
    width: u32,
    height: u32,
}

impl ChartRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        ChartRenderer {
            width: width.clamp(MIN_SIDE, MAX_SIDE),
            height: height.clamp(MIN_SIDE, MAX_SIDE),
        }
    }

    /// Renderer producing images at `scale` times the native widget size.
    pub fn scaled(native_width: u32, native_height: u32, scale: f64) -> Self {
        Self::new(
            (native_width as f64 * scale).round() as u32,
            (native_height as f64 * scale).round() as u32,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn buffer_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn render(&self, series: &MetricSeries) -> Result<ChartImage, ReportError> {
        if series.is_empty() {
            return self.placeholder(&series.descriptor);
        }

        let points: Vec<(f64, f64)> = series
            .samples
            .iter()
            .map(|sample| (sample.timestamp.timestamp() as f64, sample.value))
            .collect();
        let x_range = padded(
            points.first().map_or(0.0, |p| p.0),
            points.last().map_or(0.0, |p| p.0),
            0.0,
        );
        let y_range = value_range(&series.unit, &points);

        let mut buffer = vec![0u8; self.buffer_len()];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (self.width, self.height))
                .into_drawing_area();
            root.fill(&WHITE).map_err(render_error)?;
            let mut chart = ChartBuilder::on(&root)
                .margin(4)
                .build_cartesian_2d(x_range.clone(), y_range.clone())
                .map_err(render_error)?;

            let step = (y_range.end - y_range.start) / GRID_LINES as f64;
            chart
                .draw_series((0..=GRID_LINES).map(|i| {
                    let y = y_range.start + step * i as f64;
                    PathElement::new(vec![(x_range.start, y), (x_range.end, y)], &GRID)
                }))
                .map_err(render_error)?;

            if points.len() == 1 {
                chart
                    .draw_series(points.iter().map(|p| Circle::new(*p, 3, LINE.filled())))
                    .map_err(render_error)?;
            } else {
                chart
                    .draw_series(LineSeries::new(points, LINE.stroke_width(2)))
                    .map_err(render_error)?;
            }
            root.present().map_err(render_error)?;
        }

        self.encode(&series.descriptor, &buffer)
    }

    /// Image used when there is nothing to plot or plotting failed.
    pub fn placeholder(&self, descriptor: &MetricDescriptor) -> Result<ChartImage, ReportError> {
        let mut buffer = vec![0u8; self.buffer_len()];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (self.width, self.height))
                .into_drawing_area();
            root.fill(&PLACEHOLDER).map_err(render_error)?;
            let (w, h) = (self.width as i32, self.height as i32);
            root.draw(&Rectangle::new([(0, 0), (w - 1, h - 1)], BORDER))
                .map_err(render_error)?;
            root.draw(&PathElement::new(vec![(0, 0), (w - 1, h - 1)], BORDER))
                .map_err(render_error)?;
            root.draw(&PathElement::new(vec![(0, h - 1), (w - 1, 0)], BORDER))
                .map_err(render_error)?;
            root.present().map_err(render_error)?;
        }
        self.encode(descriptor, &buffer)
    }

    fn encode(&self, descriptor: &MetricDescriptor, rgb: &[u8]) -> Result<ChartImage, ReportError> {
        let mut png_bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut png_bytes, self.width, self.height);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(rgb)?;
            writer.finish()?;
        }
        Ok(ChartImage {
            descriptor: descriptor.clone(),
            png: png_bytes,
            width: self.width,
            height: self.height,
        })
    }
}

fn render_error<E: Display>(error: E) -> ReportError {
    ReportError::RenderFailure(error.to_string())
}

/// Y axis by unit: percentages sit on 0..100, non-negative quantities start at
/// zero, anything else is padded around the observed values.
fn value_range(unit: &str, points: &[(f64, f64)]) -> Range<f64> {
    let min = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    match unit {
        "Percent" => 0f64.min(min)..100f64.max(max),
        _ if starts_at_zero(unit) && min >= 0.0 => padded(0.0, max, 0.05),
        _ => padded(min, max, 0.05),
    }
}

fn starts_at_zero(unit: &str) -> bool {
    unit == "Count"
        || unit.starts_with("Bytes")
        || unit.starts_with("Kilobytes")
        || unit.starts_with("Megabytes")
        || unit.starts_with("Gigabytes")
        || unit.starts_with("Terabytes")
        || unit.starts_with("Bits")
        || unit.starts_with("Kilobits")
        || unit.starts_with("Megabits")
        || unit.starts_with("Gigabits")
        || unit.starts_with("Terabits")
        || unit == "Count/Second"
}

fn padded(low: f64, high: f64, fraction: f64) -> Range<f64> {
    if (high - low).abs() < f64::EPSILON {
        let pad = if low == 0.0 { 1.0 } else { low.abs() * 0.1 };
        return (low - pad)..(high + pad);
    }
    let pad = (high - low) * fraction;
    let start = if low >= 0.0 && low - pad < 0.0 { 0.0 } else { low - pad };
    start..(high + pad)
}
