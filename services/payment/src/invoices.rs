//! Monthly payer statements.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use karigo_common::AppError;

use crate::models::{Invoice, InvoiceLine, PaymentIntent, PaymentStatus};

pub const CSV_HEADER: [&str; 7] = [
    "bookingId",
    "amount",
    "currency",
    "status",
    "paymentMethodType",
    "paymentProvider",
    "createdAt",
];

/// Month covered by an invoice, as the half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthWindow {
    pub year: i32,
    pub month: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MonthWindow {
    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

/// Parses `YYYY-MM`, defaulting to the month of `now`.
pub fn parse_month(month: Option<&str>, now: DateTime<Utc>) -> Result<MonthWindow, AppError> {
    let (year, month) = match month {
        None => (now.year(), now.month()),
        Some(raw) => {
            let invalid = || AppError::Validation(format!("month must be YYYY-MM, got '{raw}'"));
            let (year, month) = raw.split_once('-').ok_or_else(invalid)?;
            if year.len() != 4 || month.len() != 2 {
                return Err(invalid());
            }
            let year: i32 = year.parse().map_err(|_| invalid())?;
            let month: u32 = month.parse().map_err(|_| invalid())?;
            if !(1..=12).contains(&month) {
                return Err(invalid());
            }
            (year, month)
        }
    };

    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    Ok(MonthWindow {
        year,
        month,
        start: month_start(year, month)?,
        end: month_start(next_year, next_month)?,
    })
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>, AppError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| AppError::Validation(format!("month {year}-{month:02} is out of range")))
}

pub fn build_invoice(payer_id: Uuid, window: &MonthWindow, intents: &[PaymentIntent], default_currency: &str) -> Invoice {
    let captured: Vec<&PaymentIntent> = intents.iter().filter(|i| i.status.is_settled()).collect();
    let captured_total: i64 = captured.iter().map(|i| i.amount).sum();
    let refunded_total: i64 = captured.iter().map(|i| i.refunded_amount).sum();

    let currency = intents
        .first()
        .map(|i| i.currency.clone())
        .unwrap_or_else(|| default_currency.to_string());

    let lines = intents
        .iter()
        .map(|intent| InvoiceLine {
            booking_id: intent.booking_id,
            amount: intent.amount,
            refunded_amount: intent.refunded_amount,
            currency: intent.currency.clone(),
            status: intent.status,
            payment_method_type: intent.payment_method_type.clone(),
            payment_provider: intent.payment_provider.clone(),
            created_at: intent.created_at,
        })
        .collect();

    Invoice {
        payer_id,
        month: window.label(),
        count: intents.len(),
        captured_total,
        refunded_total,
        net_total: captured_total - refunded_total,
        currency,
        lines,
    }
}

pub fn to_csv(invoice: &Invoice) -> Result<String, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let write_err = |e: csv::Error| AppError::Internal(format!("Failed to write invoice CSV: {e}"));

    writer.write_record(CSV_HEADER).map_err(write_err)?;
    for line in &invoice.lines {
        writer
            .write_record([
                line.booking_id.to_string(),
                line.amount.to_string(),
                line.currency.clone(),
                status_label(line.status).to_string(),
                line.payment_method_type.clone().unwrap_or_default(),
                line.payment_provider.clone().unwrap_or_default(),
                line.created_at.to_rfc3339(),
            ])
            .map_err(write_err)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("Failed to flush invoice CSV: {e}")))?;
    String::from_utf8(bytes).map_err(|e| AppError::Internal(format!("Invoice CSV is not UTF-8: {e}")))
}

fn status_label(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Pending => "PENDING",
        PaymentStatus::Confirmed => "CONFIRMED",
        PaymentStatus::Failed => "FAILED",
        PaymentStatus::Refunded => "REFUNDED",
    }
}
