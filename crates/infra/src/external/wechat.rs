//! WeChat Pay bill client.
//!
//! The provider returns bills as CSV text: one header row, one row per
//! transaction, then summary rows. Columns differ per bill type; only the
//! ones the comparison needs are read. Cells may carry a leading backtick
//! (the provider's "treat as text" marker), which is stripped.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use orderflow_reconciliation::{
    AdapterError, DateRange, ExternalLedgerAdapter, LedgerRecord, TaskType,
};

/// Bill timestamps are China Standard Time.
const PROVIDER_UTC_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone)]
pub struct WeChatConfig {
    pub base_url: String,
    pub mch_id: String,
    pub api_token: String,
    pub timeout: Duration,
    /// Minimum spacing between two requests.
    pub min_interval: Duration,
}

/// Where each needed field sits in one bill type's rows.
#[derive(Debug, Clone, Copy)]
struct BillLayout {
    path: &'static str,
    key: usize,
    amount: usize,
    status: Option<usize>,
    time: usize,
    min_fields: usize,
}

impl BillLayout {
    fn for_task(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Payment => BillLayout {
                path: "/pay/downloadbill",
                key: 0,
                amount: 20,
                status: Some(3),
                time: 15,
                min_fields: 21,
            },
            TaskType::Refund => BillLayout {
                path: "/refundquery",
                key: 0,
                amount: 12,
                status: Some(17),
                time: 16,
                min_fields: 18,
            },
            TaskType::Settlement => BillLayout {
                path: "/pay/downloadfundflow",
                key: 1,
                amount: 3,
                status: Some(10),
                time: 25,
                min_fields: 26,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct BillRequest<'a> {
    mch_id: &'a str,
    bill_type: &'static str,
    time_start: String,
    time_end: String,
}

pub struct WeChatLedgerClient {
    http: reqwest::blocking::Client,
    config: WeChatConfig,
    last_call: Mutex<Option<Instant>>,
}

impl WeChatLedgerClient {
    pub fn new(config: WeChatConfig) -> Result<Self, AdapterError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        Ok(Self::with_client(config, http))
    }

    /// Use a preconfigured HTTP client; `config.timeout` is not applied.
    pub fn with_client(config: WeChatConfig, http: reqwest::blocking::Client) -> Self {
        Self {
            http,
            config,
            last_call: Mutex::new(None),
        }
    }

    /// Block until `min_interval` has passed since the previous request.
    fn throttle(&self) {
        let Ok(mut last) = self.last_call.lock() else {
            return;
        };
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_interval {
                thread::sleep(self.config.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn fetch_bill(&self, layout: BillLayout, range: &DateRange) -> Result<String, AdapterError> {
        self.throttle();

        let offset = provider_offset();
        let format = "%Y%m%d%H%M%S";
        let body = BillRequest {
            mch_id: &self.config.mch_id,
            bill_type: "ALL",
            time_start: range.start.with_timezone(&offset).format(format).to_string(),
            time_end: range.end.with_timezone(&offset).format(format).to_string(),
        };
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), layout.path);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(AdapterError::Http {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }
        response.text().map_err(map_reqwest_error)
    }
}

impl std::fmt::Debug for WeChatLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeChatLedgerClient")
            .field("base_url", &self.config.base_url)
            .field("mch_id", &self.config.mch_id)
            .finish_non_exhaustive()
    }
}

impl ExternalLedgerAdapter for WeChatLedgerClient {
    fn name(&self) -> &str {
        "wechat"
    }

    #[instrument(skip(self), fields(mch_id = %self.config.mch_id), err)]
    fn fetch_transactions(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, AdapterError> {
        let layout = BillLayout::for_task(task_type);
        let body = self.fetch_bill(layout, range)?;
        let records = parse_bill(&body, layout, range)?;
        info!(count = records.len(), "provider bill fetched");
        Ok(records)
    }
}

fn provider_offset() -> FixedOffset {
    FixedOffset::east_opt(PROVIDER_UTC_OFFSET_SECS).unwrap_or(Utc.fix())
}

fn map_reqwest_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(err.to_string())
    } else if err.is_decode() {
        AdapterError::Decode(err.to_string())
    } else {
        AdapterError::Transport(err.to_string())
    }
}

fn cell(record: &csv::StringRecord, idx: usize) -> String {
    record
        .get(idx)
        .map(|f| f.trim().trim_start_matches('`').to_string())
        .unwrap_or_default()
}

/// Parse a decimal currency amount ("12.3", "-0.05") into cents without going through floats.
fn parse_cents(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > 2 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    let cents = whole.checked_mul(100)?.checked_add(frac)?;
    Some(if negative { -cents } else { cents })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    provider_offset()
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_bill(
    body: &str,
    layout: BillLayout,
    range: &DateRange,
) -> Result<Vec<LedgerRecord>, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| AdapterError::Decode(format!("bill csv: {e}")))?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if row.len() < layout.min_fields {
            // Summary rows at the end of the bill.
            debug!(line, fields = row.len(), "skipping short bill row");
            continue;
        }

        let key = cell(&row, layout.key);
        if key.is_empty() {
            return Err(AdapterError::Decode(format!("line {line}: empty transaction id")));
        }
        let amount_raw = cell(&row, layout.amount);
        let amount_cents = parse_cents(&amount_raw)
            .ok_or_else(|| AdapterError::Decode(format!("line {line}: bad amount {amount_raw:?}")))?;
        let status = match layout.status.map(|idx| cell(&row, idx)) {
            Some(s) if !s.is_empty() => s,
            Some(_) => {
                warn!(line, transaction_id = %key, "empty bill status, treating as SUCCESS");
                "SUCCESS".to_string()
            }
            None => "SUCCESS".to_string(),
        };
        let time_raw = cell(&row, layout.time);
        let occurred_at = match parse_time(&time_raw) {
            Some(t) => t,
            None => {
                warn!(line, value = %time_raw, "unparseable bill time, using range start");
                range.start
            }
        };

        records.push(LedgerRecord::new(key, amount_cents, status, occurred_at));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn payment_row(id: &str, amount: &str, state: &str) -> String {
        let mut fields = vec![String::new(); 21];
        fields[0] = format!("`{id}");
        fields[3] = format!("`{state}");
        fields[15] = "20240101103000".to_string();
        fields[20] = amount.to_string();
        fields.join(",")
    }

    fn range() -> DateRange {
        DateRange::for_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[test]
    fn parses_cents_exactly() {
        assert_eq!(parse_cents("12.34"), Some(1234));
        assert_eq!(parse_cents("12.3"), Some(1230));
        assert_eq!(parse_cents("7"), Some(700));
        assert_eq!(parse_cents("-0.05"), Some(-5));
        assert_eq!(parse_cents("1.234"), None);
        assert_eq!(parse_cents("abc"), None);
        assert_eq!(parse_cents(""), None);
    }

    #[test]
    fn parses_payment_bill_and_skips_summary() {
        let body = format!(
            "header\n{}\n{}\ntotal,2\n",
            payment_row("4200001", "1.00", "SUCCESS"),
            payment_row("4200002", "0.50", "REFUND"),
        );
        let records = parse_bill(&body, BillLayout::for_task(TaskType::Payment), &range()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].transaction_id, "4200001");
        assert_eq!(records[0].amount_cents, 100);
        assert_eq!(records[1].status, "REFUND");
        // 10:30 at UTC+8.
        assert_eq!(records[0].occurred_at.to_rfc3339(), "2024-01-01T02:30:00+00:00");
    }

    #[test]
    fn quoted_cell_with_comma_keeps_columns_aligned() {
        let mut fields = vec![String::new(); 21];
        fields[0] = "`4200003".to_string();
        fields[3] = "`SUCCESS".to_string();
        fields[10] = "\"Water, 5L\"".to_string();
        fields[15] = "20240101103000".to_string();
        fields[20] = "1.00".to_string();
        let body = format!("header\n{}\n", fields.join(","));

        let records = parse_bill(&body, BillLayout::for_task(TaskType::Payment), &range()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transaction_id, "4200003");
        assert_eq!(records[0].amount_cents, 100);
    }

    #[test]
    fn refund_rows_missing_status_column_are_skipped() {
        let mut fields = vec![String::new(); 17];
        fields[0] = "`5000001".to_string();
        fields[12] = "2.00".to_string();
        fields[16] = "20240101103000".to_string();
        let body = format!("header\n{}\n", fields.join(","));

        let records = parse_bill(&body, BillLayout::for_task(TaskType::Refund), &range()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn bad_amount_is_a_decode_error() {
        let body = format!("header\n{}\n", payment_row("4200001", "1.00x", "SUCCESS"));
        let err = parse_bill(&body, BillLayout::for_task(TaskType::Payment), &range()).unwrap_err();
        assert!(matches!(err, AdapterError::Decode(_)));
    }

    /// Consume headers and body so closing the socket does not reset the client.
    fn read_request(stream: &mut std::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => data.extend_from_slice(&buf[..n]),
            }
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&data[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while data.len() < header_end + content_length {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => data.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Serve a single canned HTTP response on an ephemeral port.
    fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                read_request(&mut stream);
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    fn client(base_url: String) -> WeChatLedgerClient {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .unwrap();
        WeChatLedgerClient::with_client(
            WeChatConfig {
                base_url,
                mch_id: "1900000001".into(),
                api_token: "token".into(),
                timeout: Duration::from_secs(5),
                min_interval: Duration::ZERO,
            },
            http,
        )
    }

    #[test]
    fn fetches_over_http() {
        let body = format!("header\n{}\n", payment_row("4200009", "3.00", "SUCCESS"));
        let url = serve_once("HTTP/1.1 200 OK", body);
        let records = client(url).fetch_transactions(TaskType::Payment, &range()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount_cents, 300);
    }

    #[test]
    fn maps_http_errors() {
        let url = serve_once("HTTP/1.1 429 Too Many Requests", String::new());
        assert_eq!(
            client(url).fetch_transactions(TaskType::Refund, &range()),
            Err(AdapterError::RateLimited)
        );

        let url = serve_once("HTTP/1.1 503 Service Unavailable", "maintenance".into());
        assert_eq!(
            client(url).fetch_transactions(TaskType::Settlement, &range()),
            Err(AdapterError::Http {
                status: 503,
                message: "maintenance".into()
            })
        );
    }
}
