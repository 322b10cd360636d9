//! Local spreadsheet ingestion.
//!
//! Uploaded files are read into a [`Table`] and mapped onto a
//! [`MetricsPatch`]. CSV goes through the `csv` crate, Excel through
//! `calamine` (first worksheet), JSON through the response extractor.

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::error::{DashboardError, Result};
use crate::extract::{extract_value, parse_body};
use crate::merge::merge_patches;
use crate::metrics::{
    CUSTOMER_CHANNELS, CUSTOMER_SOURCES_KEY, Coerced, CounterMap, MetricsPatch, PAYMENT_STATUS_KEY,
    PAYMENT_STATUSES, ScalarField, parse_numeric_str, to_count,
};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Scalar columns whose values are added up over all rows.
const SUMMED_COLUMNS: [ScalarField; 3] = [
    ScalarField::OccupiedUnits,
    ScalarField::FreeUnits,
    ScalarField::AutoReminders,
];

/// Scalar columns whose values are averaged over all rows.
const AVERAGED_COLUMNS: [ScalarField; 4] = [
    ScalarField::AvgContractMonths,
    ScalarField::SocialFacebook,
    ScalarField::SocialGoogle,
    ScalarField::OccupancyPct,
];

/// One uploaded file as received from the browser.
#[derive(Clone, Debug)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Upload {
            filename: filename.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn kind(&self) -> UploadKind {
        UploadKind::from_filename(&self.filename)
    }

    /// MIME type sent upstream; falls back to a guess from the extension.
    pub fn mime_type(&self) -> &str {
        match &self.content_type {
            Some(ct) if !ct.is_empty() => ct,
            _ => self.kind().mime_type(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    Csv,
    Excel,
    Json,
    Unsupported,
}

impl UploadKind {
    pub fn from_filename(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        match lower.rsplit_once('.').map(|(_, ext)| ext) {
            Some("csv") => UploadKind::Csv,
            Some("xlsx") | Some("xls") => UploadKind::Excel,
            Some("json") => UploadKind::Json,
            _ => UploadKind::Unsupported,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            UploadKind::Csv => "text/csv",
            UploadKind::Excel => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            UploadKind::Json => "application/json",
            UploadKind::Unsupported => "application/octet-stream",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    fn from_text(raw: &str) -> Self {
        match parse_numeric_str(raw) {
            Coerced::Number(v) => CellValue::Number(v),
            Coerced::Missing => CellValue::Empty,
            Coerced::Unparsable(text) => CellValue::Text(text),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Text(s) => Some(s.trim().to_string()),
            CellValue::Number(v) => Some(v.to_string()),
            CellValue::Empty => None,
        }
    }
}

/// A header row plus data rows, with normalised column names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    fn new(raw_headers: Vec<String>) -> Self {
        Table {
            headers: raw_headers.iter().map(|h| normalize_column(h)).collect(),
            rows: Vec::new(),
        }
    }

    fn column(&self, index: usize) -> impl Iterator<Item = &CellValue> {
        self.rows.iter().filter_map(move |row| row.get(index))
    }

    fn numbers(&self, index: usize) -> Vec<f64> {
        self.column(index).filter_map(CellValue::as_number).collect()
    }
}

/// Lowercase, trimmed, inner whitespace replaced by `_`.
pub fn normalize_column(name: &str) -> String {
    WHITESPACE
        .replace_all(name.trim(), "_")
        .to_lowercase()
}

/// Read CSV bytes. The delimiter is `;` when the header line has more
/// semicolons than commas, which covers German spreadsheet exports.
pub fn read_csv(bytes: &[u8]) -> Result<Table> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_start_matches('\u{feff}');
    let header_line = text.lines().next().unwrap_or_default();
    let delimiter = if header_line.matches(';').count() > header_line.matches(',').count() {
        b';'
    } else {
        b','
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| DashboardError::spreadsheet("csv", e))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(DashboardError::spreadsheet("csv", "file has no header row"));
    }

    let mut table = Table::new(headers);
    for record in reader.records() {
        let record = record.map_err(|e| DashboardError::spreadsheet("csv", e))?;
        table.rows.push(record.iter().map(CellValue::from_text).collect());
    }
    Ok(table)
}

/// Read the first worksheet of an `.xlsx`/`.xls` workbook.
#[cfg(feature = "web")]
pub fn read_excel(bytes: &[u8]) -> Result<Table> {
    use calamine::{Data, Reader, open_workbook_auto_from_rs};
    use std::io::Cursor;

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| DashboardError::spreadsheet("excel", e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| DashboardError::spreadsheet("excel", "workbook has no sheets"))?
        .map_err(|e| DashboardError::spreadsheet("excel", e))?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .ok_or_else(|| DashboardError::spreadsheet("excel", "sheet is empty"))?
        .iter()
        .map(|cell| cell.to_string())
        .collect();

    let mut table = Table::new(headers);
    for row in rows {
        table.rows.push(
            row.iter()
                .map(|cell| match cell {
                    Data::Int(i) => CellValue::Number(*i as f64),
                    Data::Float(f) => CellValue::Number(*f),
                    Data::String(s) => CellValue::from_text(s),
                    Data::Empty => CellValue::Empty,
                    other => CellValue::Text(other.to_string()),
                })
                .collect(),
        );
    }
    Ok(table)
}

#[cfg(not(feature = "web"))]
pub fn read_excel(_bytes: &[u8]) -> Result<Table> {
    Err(DashboardError::spreadsheet(
        "excel",
        "Excel support is not compiled in",
    ))
}

/// Map a table onto metrics. Unknown columns and unparsable cells are ignored.
pub fn metrics_from_table(table: &Table) -> MetricsPatch {
    let mut patch = MetricsPatch::default();
    if table.rows.is_empty() {
        return patch;
    }

    let mut sources = CounterMap::new();
    let mut statuses = CounterMap::new();
    let mut categorical_source = None;
    let mut categorical_status = None;

    for (index, header) in table.headers.iter().enumerate() {
        if let Some(field) = ScalarField::from_key(header) {
            let values = table.numbers(index);
            if values.is_empty() {
                continue;
            }
            let total: f64 = values.iter().sum();
            if SUMMED_COLUMNS.contains(&field) {
                patch.set(field, total);
            } else if AVERAGED_COLUMNS.contains(&field) {
                patch.set(field, total / values.len() as f64);
            }
        } else if let Some(channel) = header.strip_prefix(&format!("{CUSTOMER_SOURCES_KEY}_")) {
            add_column(&mut sources, canonical_name(channel, &CUSTOMER_CHANNELS), table, index);
        } else if let Some(status) = header.strip_prefix(&format!("{PAYMENT_STATUS_KEY}_")) {
            add_column(&mut statuses, canonical_name(status, &PAYMENT_STATUSES), table, index);
        } else if header.contains("herkunft") {
            categorical_source.get_or_insert(index);
        } else if header.contains("status") {
            categorical_status.get_or_insert(index);
        }
    }

    if let Some(index) = categorical_source {
        let counts = value_counts(table, index, &CUSTOMER_CHANNELS);
        crate::merge::add_counts(&mut sources, &counts);
    }
    if let Some(index) = categorical_status {
        let counts = value_counts(table, index, &PAYMENT_STATUSES);
        crate::merge::add_counts(&mut statuses, &counts);
    }

    if !sources.is_empty() {
        patch.customer_sources = Some(sources);
    }
    if !statuses.is_empty() {
        patch.payment_status = Some(statuses);
    }

    if patch.get(ScalarField::OccupancyPct).is_none() {
        if let (Some(occupied), Some(free)) = (
            patch.get(ScalarField::OccupiedUnits),
            patch.get(ScalarField::FreeUnits),
        ) {
            let total = occupied + free;
            if total > 0.0 {
                patch.set(ScalarField::OccupancyPct, (1000.0 * occupied / total).round() / 10.0);
            }
        }
    }

    patch
}

fn canonical_name(raw: &str, known: &[&str]) -> String {
    known
        .iter()
        .find(|name| name.to_lowercase() == raw)
        .map(|name| name.to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn add_column(counts: &mut CounterMap, key: String, table: &Table, index: usize) {
    let values = table.numbers(index);
    if values.is_empty() {
        return;
    }
    let total: f64 = values.iter().sum();
    match to_count(total) {
        Some(count) => {
            let slot = counts.entry(key).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        None => warn!("Ignoring out-of-range total {} in column {}", total, key),
    }
}

/// Count cells equal (case-insensitively) to one of `known`; every known key is present.
fn value_counts(table: &Table, index: usize, known: &[&str]) -> CounterMap {
    let mut counts: CounterMap = known.iter().map(|name| (name.to_string(), 0)).collect();
    for text in table.column(index).filter_map(CellValue::as_text) {
        if let Some(name) = known.iter().find(|name| name.to_lowercase() == text.to_lowercase()) {
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Read one upload into a patch of business figures.
pub fn read_upload(upload: &Upload) -> Result<MetricsPatch> {
    let wrap = |e: DashboardError| match e {
        DashboardError::Spreadsheet { message, .. } => {
            DashboardError::spreadsheet(upload.filename.clone(), message)
        }
        other => DashboardError::spreadsheet(upload.filename.clone(), other),
    };

    match upload.kind() {
        UploadKind::Csv => read_csv(&upload.bytes).map(|t| metrics_from_table(&t)).map_err(wrap),
        UploadKind::Excel => read_excel(&upload.bytes)
            .map(|t| metrics_from_table(&t))
            .map_err(wrap),
        UploadKind::Json => {
            let value = parse_body(&upload.bytes).map_err(wrap)?;
            let extraction = extract_value(&value);
            if let Some(err) = extraction.failure() {
                return Err(wrap(err));
            }
            Ok(extraction.patch.figures_only())
        }
        UploadKind::Unsupported => Err(DashboardError::spreadsheet(
            upload.filename.clone(),
            "unsupported file type (expected .csv, .xlsx, .xls or .json)",
        )),
    }
}

/// Combined result of reading every upload of one analysis cycle.
#[derive(Clone, Debug, Default)]
pub struct IngestReport {
    pub patch: MetricsPatch,
    pub warnings: Vec<String>,
    pub used_files: Vec<String>,
}

impl IngestReport {
    pub fn has_metrics(&self) -> bool {
        self.patch.has_metrics()
    }
}

/// Read all uploads. A file that fails yields a warning and is skipped.
pub fn ingest_uploads(uploads: &[Upload]) -> IngestReport {
    let mut report = IngestReport::default();
    let mut per_file = Vec::new();

    for upload in uploads {
        match read_upload(upload) {
            Ok(patch) if patch.has_metrics() => {
                info!("Read metrics from {}", upload.filename);
                per_file.push(patch);
                report.used_files.push(upload.filename.clone());
            }
            Ok(_) => {
                let message = format!("{}: no known columns found", upload.filename);
                warn!("{message}");
                report.warnings.push(message);
            }
            Err(err) => {
                warn!("Skipping upload: {err}");
                report.warnings.push(err.to_string());
            }
        }
    }

    report.patch = per_file
        .iter()
        .fold(MetricsPatch::default(), |acc, patch| merge_patches(&acc, patch));
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> CounterMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn column_names_are_normalised() {
        assert_eq!(normalize_column("  Vertragsdauer  Durchschnitt "), "vertragsdauer_durchschnitt");
        assert_eq!(normalize_column("Belegt"), "belegt");
    }

    #[cfg(feature = "web")]
    #[test]
    fn excel_workbook_is_read_like_csv() {
        use rust_xlsxwriter::Workbook;

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, header) in ["belegt", "frei", "Kundenherkunft"].into_iter().enumerate() {
            sheet.write_string(0, col as u16, header).unwrap();
        }
        let rows = [(10.0, 2.0, "Online"), (12.0, 1.0, "Empfehlung"), (3.0, 0.0, "online")];
        for (i, (belegt, frei, source)) in rows.into_iter().enumerate() {
            let row = i as u32 + 1;
            sheet.write_number(row, 0, belegt).unwrap();
            sheet.write_number(row, 1, frei).unwrap();
            sheet.write_string(row, 2, source).unwrap();
        }
        let bytes = workbook.save_to_buffer().unwrap();

        let patch = read_upload(&Upload::new("standorte.xlsx", bytes)).unwrap();
        assert_eq!(patch.get(ScalarField::OccupiedUnits), Some(25.0));
        assert_eq!(patch.get(ScalarField::FreeUnits), Some(3.0));
        assert_eq!(patch.get(ScalarField::OccupancyPct), Some(89.3));
        assert_eq!(
            patch.customer_sources,
            Some(counts(&[("Empfehlung", 1), ("Online", 2), ("Vorbeikommen", 0)]))
        );
    }

    #[test]
    fn broken_workbook_names_the_file() {
        let err = read_upload(&Upload::new("kaputt.xlsx", b"PK not a zip".to_vec())).unwrap_err();
        assert!(matches!(err, DashboardError::Spreadsheet { ref file, .. } if file == "kaputt.xlsx"));
    }

    #[test]
    fn out_of_range_column_totals_are_skipped() {
        let csv = "kundenherkunft_online;kundenherkunft_empfehlung\n9e18;1\n9e18;2\n";
        let table = read_csv(csv.as_bytes()).unwrap();
        let patch = metrics_from_table(&table);
        assert_eq!(patch.customer_sources, Some(counts(&[("Empfehlung", 3)])));
    }

    #[test]
    fn upload_kind_by_extension() {
        assert_eq!(UploadKind::from_filename("Daten.CSV"), UploadKind::Csv);
        assert_eq!(UploadKind::from_filename("a.b.xlsx"), UploadKind::Excel);
        assert_eq!(UploadKind::from_filename("export.json"), UploadKind::Json);
        assert_eq!(UploadKind::from_filename("bild.png"), UploadKind::Unsupported);
        assert_eq!(UploadKind::from_filename("README"), UploadKind::Unsupported);
    }

    #[test]
    fn csv_sums_and_averages_scalar_columns() {
        let csv = "Belegt,Frei,Vertragsdauer Durchschnitt,Reminder Automat\n10,2,6,3\n8,4,8,4\n";
        let patch = read_upload(&Upload::new("standorte.csv", csv)).unwrap();
        assert_eq!(patch.get(ScalarField::OccupiedUnits), Some(18.0));
        assert_eq!(patch.get(ScalarField::FreeUnits), Some(6.0));
        assert_eq!(patch.get(ScalarField::AvgContractMonths), Some(7.0));
        assert_eq!(patch.get(ScalarField::AutoReminders), Some(7.0));
        assert_eq!(patch.get(ScalarField::OccupancyPct), Some(75.0));
    }

    #[test]
    fn semicolon_csv_with_decimal_commas() {
        let csv = "belegt;frei;belegungsgrad;social_google\n20;5;80;61,5\n";
        let patch = read_upload(&Upload::new("export.csv", csv)).unwrap();
        assert_eq!(patch.get(ScalarField::OccupiedUnits), Some(20.0));
        // explicit column beats the derived value
        assert_eq!(patch.get(ScalarField::OccupancyPct), Some(80.0));
        assert_eq!(patch.get(ScalarField::SocialGoogle), Some(61.5));
    }

    #[test]
    fn flattened_counter_columns() {
        let csv = "kundenherkunft_online,Kundenherkunft_Empfehlung,zahlungsstatus_überfällig\n3,1,2\n2,0,1\n";
        let patch = read_upload(&Upload::new("k.csv", csv)).unwrap();
        assert_eq!(patch.customer_sources, Some(counts(&[("Empfehlung", 1), ("Online", 5)])));
        assert_eq!(patch.payment_status, Some(counts(&[("überfällig", 3)])));
    }

    #[test]
    fn categorical_columns_are_value_counted() {
        let csv = "Mieter,Kundenherkunft,Zahlungsstatus\nA,Online,bezahlt\nB,online,offen\nC,Empfehlung,bezahlt\nD,Zeitung,storniert\n";
        let patch = read_upload(&Upload::new("mieter.csv", csv)).unwrap();
        assert_eq!(
            patch.customer_sources,
            Some(counts(&[("Empfehlung", 1), ("Online", 2), ("Vorbeikommen", 0)]))
        );
        assert_eq!(
            patch.payment_status,
            Some(counts(&[("bezahlt", 2), ("offen", 1), ("überfällig", 0)]))
        );
    }

    #[test]
    fn unparsable_cells_are_skipped() {
        let csv = "belegt,frei\n10,x\n,3\nzehn,1\n";
        let patch = read_upload(&Upload::new("m.csv", csv)).unwrap();
        assert_eq!(patch.get(ScalarField::OccupiedUnits), Some(10.0));
        assert_eq!(patch.get(ScalarField::FreeUnits), Some(4.0));
    }

    #[test]
    fn json_upload_keeps_only_figures() {
        let json = r#"{"metrics": {"belegt": 30}, "recommendations": ["x"], "customer_message": "hi"}"#;
        let patch = read_upload(&Upload::new("analyse.json", json)).unwrap();
        assert_eq!(patch.get(ScalarField::OccupiedUnits), Some(30.0));
        assert!(patch.recommendations.is_none());
        assert!(patch.customer_message.is_none());
    }

    #[test]
    fn bad_files_become_warnings_and_others_continue() {
        let uploads = vec![
            Upload::new("kaputt.json", "{not json"),
            Upload::new("bild.png", vec![0u8, 1, 2]),
            Upload::new("leer.csv", "name,ort\nA,Berlin\n"),
            Upload::new("a.csv", "belegt,kundenherkunft_online\n10,2\n"),
            Upload::new("b.csv", "belegt,kundenherkunft_online\n12,1\n"),
        ];
        let report = ingest_uploads(&uploads);
        assert_eq!(report.used_files, vec!["a.csv", "b.csv"]);
        assert_eq!(report.warnings.len(), 3);
        assert!(report.warnings[0].contains("kaputt.json"));
        assert!(report.warnings[1].contains("bild.png"));
        assert_eq!(report.patch.get(ScalarField::OccupiedUnits), Some(12.0));
        assert_eq!(report.patch.customer_sources, Some(counts(&[("Online", 3)])));
    }

    #[test]
    fn empty_csv_is_an_error() {
        let err = read_upload(&Upload::new("leer.csv", "")).unwrap_err();
        assert!(matches!(err, DashboardError::Spreadsheet { ref file, .. } if file == "leer.csv"));
    }

    #[test]
    fn csv_file_on_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "belegt,frei").unwrap();
        writeln!(file, "21,3").unwrap();
        let bytes = std::fs::read(file.path()).unwrap();
        let patch = metrics_from_table(&read_csv(&bytes).unwrap());
        assert_eq!(patch.get(ScalarField::OccupancyPct), Some(87.5));
    }
}
