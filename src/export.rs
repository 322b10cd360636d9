//! Download formats for the current figures, the comparison and the history.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{DashboardError, Result};
use crate::metrics::{CUSTOMER_SOURCES_KEY, CanonicalMetrics, PAYMENT_STATUS_KEY, ScalarField, now_iso};
use crate::session::HistoryEntry;

/// Separator for list fields in flat exports.
pub const LIST_SEPARATOR: &str = " | ";

/// File name like `storage_current_kunde_demo_123_20240601.csv`.
pub fn export_filename(kind: &str, tenant_id: &str, date: NaiveDate, ext: &str) -> String {
    format!("storage_{kind}_{tenant_id}_{}.{ext}", date.format("%Y%m%d"))
}

/// Key/value pairs of `data` in export column order, counters flattened.
pub fn flatten(data: &CanonicalMetrics) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = ScalarField::ALL
        .iter()
        .map(|&field| (field.key().to_string(), data.scalar(field).to_string()))
        .collect();

    for (key, count) in &data.customer_sources {
        fields.push((format!("{CUSTOMER_SOURCES_KEY}_{key}"), count.to_string()));
    }
    for (key, count) in &data.payment_status {
        fields.push((format!("{PAYMENT_STATUS_KEY}_{key}"), count.to_string()));
    }

    let series: Vec<String> = data
        .new_customers_per_month
        .iter()
        .map(|v| v.to_string())
        .collect();
    fields.push(("neukunden_labels".into(), data.new_customer_labels.join(LIST_SEPARATOR)));
    fields.push(("neukunden_monat".into(), series.join(LIST_SEPARATOR)));
    fields.push(("recommendations".into(), data.recommendations.join(LIST_SEPARATOR)));
    fields.push(("customer_message".into(), data.customer_message.clone()));
    fields.push(("analysis_date".into(), data.analysis_date.clone()));
    fields.push(("tenant_id".into(), data.tenant_id.clone().unwrap_or_default()));
    fields
}

/// Header row plus one data row.
pub fn to_csv(data: &CanonicalMetrics) -> Result<String> {
    let fields = flatten(data);
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |e: csv::Error| DashboardError::Export(e.to_string());
    writer
        .write_record(fields.iter().map(|(key, _)| key))
        .map_err(csv_err)?;
    writer
        .write_record(fields.iter().map(|(_, value)| value))
        .map_err(csv_err)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| DashboardError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| DashboardError::Export(e.to_string()))
}

/// Pretty-printed JSON; non-ASCII characters are written as-is.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| DashboardError::Export(e.to_string()))
}

#[derive(Serialize)]
struct Comparison<'a> {
    vorher: &'a CanonicalMetrics,
    nachher: &'a CanonicalMetrics,
    vergleich_datum: String,
}

pub fn comparison_json(before: &CanonicalMetrics, after: &CanonicalMetrics) -> Result<String> {
    to_json(&Comparison {
        vorher: before,
        nachher: after,
        vergleich_datum: now_iso(),
    })
}

pub fn history_json(entries: &[&HistoryEntry]) -> Result<String> {
    to_json(entries)
}

/// Two-column key/value workbook.
#[cfg(feature = "web")]
pub fn to_xlsx(data: &CanonicalMetrics) -> Result<Vec<u8>> {
    use rust_xlsxwriter::{Format, Workbook};

    let xlsx_err = |e: rust_xlsxwriter::XlsxError| DashboardError::Export(e.to_string());

    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Kennzahlen").map_err(xlsx_err)?;
    worksheet
        .write_string_with_format(0, 0, "Feld", &bold)
        .map_err(xlsx_err)?;
    worksheet
        .write_string_with_format(0, 1, "Wert", &bold)
        .map_err(xlsx_err)?;

    for (row, (key, value)) in flatten(data).iter().enumerate() {
        let row = row as u32 + 1;
        worksheet.write_string(row, 0, key).map_err(xlsx_err)?;
        match value.parse::<f64>() {
            Ok(number) => worksheet.write_number(row, 1, number),
            Err(_) => worksheet.write_string(row, 1, value),
        }
        .map_err(xlsx_err)?;
    }
    worksheet.set_column_width(0, 32).map_err(xlsx_err)?;
    worksheet.set_column_width(1, 60).map_err(xlsx_err)?;

    workbook.save_to_buffer().map_err(xlsx_err)
}
