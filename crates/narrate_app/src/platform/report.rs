//! Text rendering of the sync view for the log.

use narrate_core::{JobRowView, SyncViewModel};
use narrate_engine::{ChannelType, ConnectionSnapshot};

pub fn render_view(view: &SyncViewModel) -> Vec<String> {
    let mut lines: Vec<String> = view.jobs.iter().map(render_row).collect();
    lines.push(format!(
        "{} jobs cached, {} segments unresolved, {} queries stale",
        view.jobs.len(),
        view.unresolved_units,
        view.stale_queries.len()
    ));
    lines
}

fn render_row(row: &JobRowView) -> String {
    let mut line = format!(
        "job {} [{}] {}: {}/{} ({}%)",
        row.job_id, row.parent_id, row.status, row.processed_units, row.total_units, row.percent
    );
    if let Some(message) = &row.error_message {
        line.push_str(" error: ");
        line.push_str(message);
    }
    line
}

pub fn render_connection(snapshot: &ConnectionSnapshot) -> String {
    let channel = match snapshot.channel_type {
        ChannelType::Push => "push",
        ChannelType::Polling => "polling",
        ChannelType::None => "none",
    };
    format!(
        "channel {} {:?}, {} reconnect attempts, {} events received",
        channel, snapshot.status, snapshot.reconnect_attempts, snapshot.events_received
    )
}
