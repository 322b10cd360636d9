/*!
# Self-Storage Dashboard

A browser-based business dashboard for self-storage operators, built in Rust.

## Overview

Tenants upload spreadsheets (CSV, Excel) or JSON exports of their facility
figures. The files are read locally and also sent to an external analysis
workflow. Whatever comes back is normalized into one canonical record, merged
over the previous state and shown as KPI tiles, charts, recommendations and a
per-tenant history.

## Architecture

### Normalization pipeline
- **classify**: Detects which envelope shape a webhook reply has
- **extract**: Pulls a `MetricsPatch` out of any recognised envelope
- **merge**: Applies a patch to a `CanonicalMetrics` record (counters add up,
  narrative fields are replaced)

### Inputs
- **ingest**: Spreadsheet and JSON uploads mapped onto the metrics record
- **webhook**: Outbound JSON requests to the analysis workflow

### Session and presentation
- **session**: Per-browser state (current figures, comparison, history)
- **tenants**: Tenant table, login, logout and the auth middleware
- **kpi**, **insights**: Tile deltas and rule-based recommendations
- **export**: CSV, JSON and XLSX downloads
- **charts**: SVG charts
- **app**: Routing and handlers

## Failure handling

No error is fatal. A failed or malformed reply keeps the last good state and
the user gets a warning with a short excerpt of what arrived.
*/

pub mod classify;
pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod ingest;
pub mod insights;
pub mod kpi;
pub mod merge;
pub mod metrics;
pub mod session;
pub mod tenants;
pub mod webhook;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod charts;

pub use classify::{Envelope, ShapeKind, classify};
pub use error::{DashboardError, Result};
pub use extract::{Extraction, extract, extract_value};
pub use merge::merge;
pub use metrics::{CanonicalMetrics, MetricsPatch, ScalarField};
