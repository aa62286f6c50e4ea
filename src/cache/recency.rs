use chrono::{DateTime, Utc};

/// Human-readable "synced N ago" text.
pub fn format_time_ago(last_synced: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
  let Some(last) = last_synced else {
    return "Never".to_string();
  };

  let seconds = (now - last).num_seconds();
  if seconds < 60 {
    return "Just now".to_string();
  }
  let minutes = seconds / 60;
  if minutes < 60 {
    return format!("{}m ago", minutes);
  }
  let hours = minutes / 60;
  if hours < 24 {
    return format!("{}h ago", hours);
  }
  format!("{}d ago", hours / 24)
}
