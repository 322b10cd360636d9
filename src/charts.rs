#![cfg(feature = "web")]
//! SVG charts for the dashboard page.
//!
//! Every chart is drawn into an in-memory SVG string with `plotters`, so the
//! handlers can serve it directly as `image/svg+xml`.

use plotters::prelude::*;

use crate::error::{DashboardError, Result};
use crate::kpi::TILE_FIELDS;
use crate::metrics::{CanonicalMetrics, CounterMap, ScalarField};
use crate::session::{DashboardSession, display_ts};

const PRIMARY: RGBColor = RGBColor(0x7C, 0x3A, 0xED);
const ACCENT: RGBColor = RGBColor(0x14, 0xB8, 0xA6);
const HIGHLIGHT: RGBColor = RGBColor(0xF5, 0x9E, 0x0B);
const BASELINE: RGBColor = RGBColor(0xCB, 0xD5, 0xE1);

/// Size and caption of a rendered chart
#[derive(Clone, Debug)]
pub struct ChartOptions {
    /// Caption drawn above the plot
    pub title: String,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            width: 640,
            height: 360,
        }
    }
}

impl ChartOptions {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Charts served under `/charts/{name}.svg`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartKind {
    /// Before/after bars over the KPI tile fields
    Comparison,

    /// Counts per customer channel
    CustomerSources,

    /// Counts per payment status
    PaymentStatus,

    /// Monthly new-customer series
    NewCustomers,

    /// One scalar over the tenant's history, oldest first
    History(ScalarField),
}

impl ChartKind {
    /// Parse a chart name such as `comparison` or `history-belegt`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "comparison" => Some(ChartKind::Comparison),
            "kundenherkunft" => Some(ChartKind::CustomerSources),
            "zahlungsstatus" => Some(ChartKind::PaymentStatus),
            "neukunden" => Some(ChartKind::NewCustomers),
            _ => name
                .strip_prefix("history-")
                .and_then(ScalarField::from_key)
                .map(ChartKind::History),
        }
    }
}

/// Draw `kind` from the state of one session.
///
/// Fails with [`DashboardError::NoUsableData`] when the session has nothing to
/// draw for this chart, e.g. no comparison or fewer than two history entries.
pub fn render(kind: ChartKind, session: &DashboardSession) -> Result<String> {
    match kind {
        ChartKind::Comparison => {
            let (before, after) = session
                .comparison()
                .ok_or_else(|| DashboardError::NoUsableData("no comparison to draw".to_string()))?;
            comparison_chart(before, after, &ChartOptions::titled("Vorher / Nachher"))
        }
        ChartKind::CustomerSources => counter_chart(
            &session.current.customer_sources,
            &ChartOptions::titled("Kundenherkunft"),
            ACCENT,
        ),
        ChartKind::PaymentStatus => counter_chart(
            &session.current.payment_status,
            &ChartOptions::titled("Zahlungsstatus"),
            HIGHLIGHT,
        ),
        ChartKind::NewCustomers => {
            new_customers_chart(&session.current, &ChartOptions::titled("Neukunden pro Monat"))
        }
        ChartKind::History(field) => {
            let mut entries = session.tenant_history();
            entries.reverse();
            let points: Vec<(String, f64)> = entries
                .iter()
                .map(|entry| (display_ts(&entry.ts), entry.data.scalar(field)))
                .collect();
            history_chart(
                &points,
                &ChartOptions::titled(format!("Verlauf: {}", field.label())),
            )
        }
    }
}

/// Grouped bars, baseline in grey next to the newer values.
pub fn comparison_chart(
    before: &CanonicalMetrics,
    after: &CanonicalMetrics,
    options: &ChartOptions,
) -> Result<String> {
    let labels: Vec<String> = TILE_FIELDS.iter().map(|f| f.label().to_string()).collect();
    let max = TILE_FIELDS
        .iter()
        .flat_map(|&f| [before.scalar(f), after.scalar(f)])
        .fold(0.0_f64, f64::max);

    let mut svg = String::new();
    {
        let root =
            SVGBackend::with_string(&mut svg, (options.width, options.height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 22).into_font())
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(category_range(labels.len()), 0.0..headroom(max))
            .map_err(draw_err)?;

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(labels.len() * 2 + 1)
            .x_label_formatter(&|x| label_at(&labels, *x))
            .draw()
            .map_err(draw_err)?;

        chart
            .draw_series(TILE_FIELDS.iter().enumerate().map(|(i, &field)| {
                let x = i as f64;
                Rectangle::new([(x - 0.35, 0.0), (x, before.scalar(field))], BASELINE.filled())
            }))
            .map_err(draw_err)?
            .label("Vorher")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], BASELINE.filled()));

        chart
            .draw_series(TILE_FIELDS.iter().enumerate().map(|(i, &field)| {
                let x = i as f64;
                Rectangle::new([(x, 0.0), (x + 0.35, after.scalar(field))], PRIMARY.filled())
            }))
            .map_err(draw_err)?
            .label("Nachher")
            .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], PRIMARY.filled()));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(draw_err)?;

        root.present().map_err(draw_err)?;
    }
    Ok(svg)
}

/// One bar per counter key, in key order.
pub fn counter_chart(counts: &CounterMap, options: &ChartOptions, color: RGBColor) -> Result<String> {
    let labels: Vec<String> = counts.keys().cloned().collect();
    let max = counts.values().copied().max().unwrap_or(0) as f64;

    let mut svg = String::new();
    {
        let root =
            SVGBackend::with_string(&mut svg, (options.width, options.height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 22).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(40)
            .build_cartesian_2d(category_range(labels.len()), 0.0..headroom(max))
            .map_err(draw_err)?;

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(labels.len() * 2 + 1)
            .x_label_formatter(&|x| label_at(&labels, *x))
            .draw()
            .map_err(draw_err)?;

        chart
            .draw_series(counts.values().enumerate().map(|(i, &count)| {
                let x = i as f64;
                Rectangle::new([(x - 0.3, 0.0), (x + 0.3, count as f64)], color.filled())
            }))
            .map_err(draw_err)?;

        root.present().map_err(draw_err)?;
    }
    Ok(svg)
}

/// Area chart of `neukunden_monat` against `neukunden_labels`.
pub fn new_customers_chart(data: &CanonicalMetrics, options: &ChartOptions) -> Result<String> {
    let values = &data.new_customers_per_month;
    if values.is_empty() {
        return Err(DashboardError::NoUsableData("no new-customer series".to_string()));
    }
    let labels: Vec<String> = (0..values.len())
        .map(|i| {
            data.new_customer_labels
                .get(i)
                .cloned()
                .unwrap_or_else(|| (i + 1).to_string())
        })
        .collect();
    let max = values.iter().copied().fold(0.0_f64, f64::max);

    let mut svg = String::new();
    {
        let root =
            SVGBackend::with_string(&mut svg, (options.width, options.height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 22).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(40)
            .build_cartesian_2d(category_range(labels.len()), 0.0..headroom(max))
            .map_err(draw_err)?;

        chart
            .configure_mesh()
            .x_labels(labels.len() * 2 + 1)
            .x_label_formatter(&|x| label_at(&labels, *x))
            .draw()
            .map_err(draw_err)?;

        chart
            .draw_series(
                AreaSeries::new(
                    values.iter().enumerate().map(|(i, &v)| (i as f64, v)),
                    0.0,
                    PRIMARY.mix(0.2),
                )
                .border_style(PRIMARY),
            )
            .map_err(draw_err)?;

        root.present().map_err(draw_err)?;
    }
    Ok(svg)
}

/// Line chart of labelled points. At least two points are required.
pub fn history_chart(points: &[(String, f64)], options: &ChartOptions) -> Result<String> {
    if points.len() < 2 {
        return Err(DashboardError::NoUsableData(
            "at least two history entries are needed".to_string(),
        ));
    }
    let labels: Vec<String> = points.iter().map(|(label, _)| label.clone()).collect();
    let max = points.iter().map(|&(_, v)| v).fold(0.0_f64, f64::max);
    let min = points.iter().map(|&(_, v)| v).fold(0.0_f64, f64::min);

    let mut svg = String::new();
    {
        let root =
            SVGBackend::with_string(&mut svg, (options.width, options.height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 22).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(40)
            .build_cartesian_2d(category_range(labels.len()), min..headroom(max))
            .map_err(draw_err)?;

        chart
            .configure_mesh()
            .x_labels(labels.len() * 2 + 1)
            .x_label_formatter(&|x| label_at(&labels, *x))
            .draw()
            .map_err(draw_err)?;

        let series = || points.iter().enumerate().map(|(i, &(_, v))| (i as f64, v));
        chart
            .draw_series(LineSeries::new(series(), ACCENT.stroke_width(2)))
            .map_err(draw_err)?;
        chart
            .draw_series(series().map(|p| Circle::new(p, 4, ACCENT.filled())))
            .map_err(draw_err)?;

        root.present().map_err(draw_err)?;
    }
    Ok(svg)
}

/// X range with each category centred on an integer.
fn category_range(len: usize) -> std::ops::Range<f64> {
    -0.5..(len.max(1) as f64 - 0.5)
}

/// Upper y bound with some room above the tallest value.
fn headroom(max: f64) -> f64 {
    if max > 0.0 { max * 1.15 } else { 1.0 }
}

/// Label for an axis tick; ticks between categories stay blank.
fn label_at(labels: &[String], x: f64) -> String {
    let index = x.round();
    if (x - index).abs() > 1e-6 || index < 0.0 {
        return String::new();
    }
    labels.get(index as usize).cloned().unwrap_or_default()
}

fn draw_err<E: std::fmt::Display>(err: E) -> DashboardError {
    DashboardError::Export(format!("chart: {err}"))
}
