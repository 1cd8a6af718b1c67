use chrono::{DateTime, Utc};

/// Format an age in minutes as "just now", "5m ago", "2h ago" or "3d ago".
/// Hours and days round up from the half.
pub fn format_age(minutes: i64) -> String {
    if minutes < 1 {
        // Negative ages come from clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Format a money amount with its currency code, e.g. "PKR 1,250.50".
pub fn format_amount(amount: f64, currency: &str) -> String {
    let sign = if amount < 0.0 { "-" } else { "" };
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{} {}{}.{:02}", currency, sign, grouped, cents % 100)
}

/// Format a timestamp as a short local-independent date ("Mar 05, 2026").
pub fn format_date(at: DateTime<Utc>) -> String {
    at.format("%b %d, %Y").to_string()
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}
