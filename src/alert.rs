use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::aggregator::PersistenceStatus;
use crate::models::{RouteKey, Sample, Status};

#[derive(Debug, Clone)]
pub enum AlertEvent {
    Transition {
        route: RouteKey,
        from: Status,
        to: Status,
        sample: Sample,
    },
    Degraded(PersistenceStatus),
    Recovered,
}

/// Remembers the last status per route and reports changes.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: HashMap<RouteKey, Status>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A route seen for the first time only counts as a transition when it is down.
    pub fn observe(&mut self, sample: &Sample) -> Option<AlertEvent> {
        let route = sample.route();
        let new_status = Status::from(sample.success);
        let old_status = self.last.insert(route.clone(), new_status);

        let from = match old_status {
            Some(old) if old != new_status => old,
            None if new_status == Status::Down => Status::Up,
            _ => return None,
        };

        let msg = format!(
            "[CHANGE] {} -> {:?}{}",
            route,
            new_status,
            sample.error.map(|e| format!(" ({})", e)).unwrap_or_default()
        );
        if new_status == Status::Down {
            error!("{}", msg);
        } else {
            warn!("{}", msg);
        }

        Some(AlertEvent::Transition { route, from, to: new_status, sample: sample.clone() })
    }
}

/// Posts alert events to a Discord-style webhook.
pub struct Notifier {
    http_client: reqwest::Client,
    webhook_url: String,
}

impl Notifier {
    pub fn new(webhook_url: String) -> Self {
        Self { http_client: reqwest::Client::new(), webhook_url }
    }

    /// Drains `rx` until every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<AlertEvent>) {
        while let Some(event) = rx.recv().await {
            self.send(&event).await;
        }
        debug!("Alert channel closed, notifier stopping");
    }

    async fn send(&self, event: &AlertEvent) {
        let payload = webhook_payload(event);
        match self.http_client.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "Webhook rejected alert");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Webhook delivery failed"),
        }
    }
}

pub fn webhook_payload(event: &AlertEvent) -> serde_json::Value {
    let (title, color, fields) = match event {
        AlertEvent::Transition { route, from, to, sample } => {
            let color = if *to == Status::Up { 0x2ECC71 } else { 0xE74C3C };
            let fields = serde_json::json!([
                { "name": "Series", "value": route.series(), "inline": true },
                { "name": "Route", "value": route.route(), "inline": true },
                { "name": "Transition", "value": format!("{:?} \u{2192} {:?}", from, to), "inline": true },
                { "name": "Latency", "value": sample.latency_ms.map_or("N/A".to_string(), |l| format!("{:.2}ms", l)), "inline": true },
                { "name": "Reason", "value": sample.error.map_or("ok".to_string(), |e| e.to_string()), "inline": false }
            ]);
            ("Probe Status Transition", color, fields)
        }
        AlertEvent::Degraded(status) => {
            let fields = serde_json::json!([
                { "name": "Consecutive failures", "value": status.consecutive_failures.to_string(), "inline": true },
                { "name": "Dropped samples", "value": status.dropped.to_string(), "inline": true },
                { "name": "Last error", "value": status.last_error.clone().unwrap_or_default(), "inline": false }
            ]);
            ("Log Writer Degraded", 0xE67E22, fields)
        }
        AlertEvent::Recovered => ("Log Writer Recovered", 0x2ECC71, serde_json::json!([])),
    };

    serde_json::json!({
        "username": "vdapulse",
        "embeds": [{
            "title": title,
            "color": color,
            "fields": fields,
            "timestamp": Utc::now().to_rfc3339(),
            "footer": { "text": "vdapulse probe collector" }
        }]
    })
}
