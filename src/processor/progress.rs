//! Progress Accounting
//!
//! Human-readable size/speed formatting (binary units) and the per-batch
//! progress line written to the task log.

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Format a byte count in binary units
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes / KIB)
    } else {
        format!("{} B", bytes as u64)
    }
}

/// Format a transfer rate in binary units per second
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= MIB {
        format!("{:.2} MiB/s", bytes_per_sec / MIB)
    } else if bytes_per_sec >= KIB {
        format!("{:.2} KiB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}

/// Throughput is computed only when the duration is positive and the size
/// is known.
pub fn compute_speed(bytes: Option<u64>, duration_secs: f64) -> Option<f64> {
    match bytes {
        Some(bytes) if duration_secs > 0.0 => Some(bytes as f64 / duration_secs),
        _ => None,
    }
}

/// Progress percent, saturating at 100; a zero total yields 0.
pub fn progress_percent(processed: i64, total: i64) -> u32 {
    if total <= 0 {
        return 0;
    }
    let percent = ((processed as f64 / total as f64) * 100.0).round() as i64;
    percent.clamp(0, 100) as u32
}

/// Render the progress line written to the task log after every batch:
/// percent, a 20-cell ASCII bar, counts and the stage label.
pub fn progress_line(processed: i64, total: i64, stage: &str) -> String {
    if total <= 0 {
        return match stage.is_empty() {
            true => "Progress: waiting for files".to_string(),
            false => format!("Progress: waiting for files - {}", stage),
        };
    }

    let percent = progress_percent(processed, total);
    let filled = (percent / 5) as usize;
    let bar: String = "#".repeat(filled) + &"-".repeat(20 - filled);

    let stage_text = if stage.is_empty() {
        String::new()
    } else {
        format!(" - {}", stage)
    };
    format!(
        "Progress: {}% [{}] ({}/{}){}",
        percent, bar, processed, total, stage_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(100.0), "100.00 B/s");
        assert_eq!(format_speed(1536.0), "1.50 KiB/s");
        assert_eq!(format_speed(2.0 * 1024.0 * 1024.0), "2.00 MiB/s");
    }

    #[test]
    fn test_compute_speed_guards() {
        assert_eq!(compute_speed(Some(1000), 2.0), Some(500.0));
        assert_eq!(compute_speed(Some(1000), 0.0), None);
        assert_eq!(compute_speed(None, 2.0), None);
    }

    #[test]
    fn test_progress_percent_saturation() {
        assert_eq!(progress_percent(0, 10), 0);
        assert_eq!(progress_percent(5, 10), 50);
        assert_eq!(progress_percent(15, 10), 100);
        assert_eq!(progress_percent(3, 0), 0);
    }

    #[test]
    fn test_progress_line_shape() {
        let line = progress_line(5, 10, "STRM batch 1");
        assert!(line.contains("50%"));
        assert!(line.contains("(5/10)"));
        assert!(line.contains("STRM batch 1"));
        assert!(line.contains("##########----------"));
    }

    #[test]
    fn test_progress_line_zero_total() {
        assert!(progress_line(0, 0, "").contains("waiting"));
    }
}
