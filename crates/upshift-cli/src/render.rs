use anstyle::{AnsiColor, Style};
use indicatif::{ProgressBar, ProgressStyle};

/// Human-readable transfer status built from the engine's raw progress
/// triple, e.g. "376 KB of 9.3 MB, 120 KB/s, 01:15 remain".
pub fn format_transfer_status(bytes_so_far: u64, total_bytes: u64, elapsed_seconds: u64) -> String {
    let current_kb = (bytes_so_far + 512) / 1024;
    let total_kb = (total_bytes + 512) / 1024;
    let progress = format_kbytes(current_kb, total_kb);

    let rate_kb = if elapsed_seconds > 0 {
        current_kb / elapsed_seconds
    } else {
        0
    };
    let rate = format_rate(rate_kb);

    if rate_kb > 0 && total_bytes > bytes_so_far {
        let remaining_kb = (total_bytes - bytes_so_far) / 1024;
        let remaining = format_seconds(remaining_kb / rate_kb);
        format!("{progress}, {rate}, {remaining} remain")
    } else {
        format!("{progress}, {rate}")
    }
}

/// Kilobyte/megabyte progress with the unit switching at 1024 of a unit:
///
///   current < 1MB, total < 1MB   ->  "x of y KB"
///   current < 1MB, total >= 1MB  ->  "x KB of y MB"
///   current >= 1MB, total >= 1MB ->  "x of y MB"
pub fn format_kbytes(current_kb: u64, total_kb: u64) -> String {
    let current_has_mb = current_kb / 1024 > 0;
    let total_has_mb = total_kb / 1024 > 0;

    if total_kb == 0 {
        return if current_has_mb {
            format!("{:.1} MB", current_kb as f64 / 1024.0)
        } else {
            format!("{current_kb} KB")
        };
    }

    if current_has_mb && total_has_mb {
        format!(
            "{:.1} of {:.1} MB",
            current_kb as f64 / 1024.0,
            total_kb as f64 / 1024.0
        )
    } else if total_has_mb {
        format!("{current_kb} KB of {:.1} MB", total_kb as f64 / 1024.0)
    } else {
        format!("{current_kb} of {total_kb} KB")
    }
}

pub fn format_rate(rate_kb: u64) -> String {
    if rate_kb == 0 {
        return "??.? KB/s".to_string();
    }
    if rate_kb / 1024 > 0 {
        let rate_mb = rate_kb as f64 / 1024.0;
        if rate_mb > 100.0 {
            format!("{} MB/s", rate_mb.round())
        } else {
            format!("{rate_mb:.1} MB/s")
        }
    } else {
        format!("{rate_kb} KB/s")
    }
}

pub fn format_seconds(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn print_status(label: &str, message: &str) {
    let style = label_style(label);
    println!("{style}{label:>10}{style:#} {message}");
}

fn label_style(label: &str) -> Style {
    let color = match label {
        "failed" => AnsiColor::Red,
        "succeeded" | "applied" => AnsiColor::Green,
        _ => AnsiColor::Cyan,
    };
    Style::new().bold().fg_color(Some(color.into()))
}

pub fn download_progress_bar(total_bytes: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(total_bytes.max(1));
    if let Ok(style) =
        ProgressStyle::with_template("{bar:30.cyan/blue} {bytes:>9}/{total_bytes:9} {msg}")
    {
        progress_bar.set_style(style.progress_chars("=>-"));
    }
    progress_bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kbyte_formatting_switches_units_at_one_megabyte() {
        assert_eq!(format_kbytes(376, 900), "376 of 900 KB");
        assert_eq!(format_kbytes(376, 9523), "376 KB of 9.3 MB");
        assert_eq!(format_kbytes(3481, 4813), "3.4 of 4.7 MB");
        assert_eq!(format_kbytes(512, 0), "512 KB");
    }

    #[test]
    fn rate_formatting_switches_units_and_marks_unknown() {
        assert_eq!(format_rate(0), "??.? KB/s");
        assert_eq!(format_rate(120), "120 KB/s");
        assert_eq!(format_rate(2048), "2.0 MB/s");
        assert_eq!(format_rate(1024 * 250), "250 MB/s");
    }

    #[test]
    fn seconds_formatting_pads_and_adds_hours_when_needed() {
        assert_eq!(format_seconds(75), "01:15");
        assert_eq!(format_seconds(3675), "01:01:15");
        assert_eq!(format_seconds(9), "00:09");
    }

    #[test]
    fn transfer_status_combines_progress_rate_and_remaining() {
        // 10 MB of 20 MB in 10 seconds: 1 MB/s, ~10 seconds left.
        let status = format_transfer_status(10 * 1024 * 1024, 20 * 1024 * 1024, 10);
        assert_eq!(status, "10.0 of 20.0 MB, 1.0 MB/s, 00:10 remain");

        // No elapsed time yet: rate and remaining are unknown.
        let status = format_transfer_status(100 * 1024, 900 * 1024, 0);
        assert_eq!(status, "100 of 900 KB, ??.? KB/s");
    }
}
