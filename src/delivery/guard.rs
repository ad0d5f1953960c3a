//! Outbound delivery guards: URL screening and flood control.
//!
//! The URL screen keeps webhook traffic off loopback, private, and
//! link-local addresses; the flood guard caps how many events a single
//! destination can receive per rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Max events per (destination, event name) within [`FLOOD_WINDOW_SECS`].
pub const FLOOD_LIMIT: usize = 100;
/// Rolling flood window, in seconds.
pub const FLOOD_WINDOW_SECS: i64 = 60;

/// Screen a delivery URL before any network I/O.
///
/// Rejects non-http(s) schemes, hostnames that name local or internal
/// infrastructure, IP literals in private or special-use ranges, and
/// hostnames that resolve to such addresses. A hostname that fails to
/// resolve is rejected too: an unresolvable destination cannot be
/// shown to be safe.
pub async fn screen_url(raw: &str) -> Result<()> {
    let url: Url = raw
        .parse()
        .map_err(|e| Error::DeliveryBlocked(format!("invalid url {raw:?}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::DeliveryBlocked(format!(
                "scheme {other:?} not allowed"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::DeliveryBlocked("url has no host".into()))?;

    let lowered = host.to_ascii_lowercase();
    if lowered == "localhost"
        || lowered.ends_with(".localhost")
        || lowered.ends_with(".local")
        || lowered.ends_with(".internal")
    {
        return Err(Error::DeliveryBlocked(format!(
            "host {host:?} names local infrastructure"
        )));
    }

    if let Ok(ip) = lowered.trim_matches(['[', ']']).parse::<IpAddr>() {
        check_ip(ip, host)?;
        return Ok(());
    }

    // Resolve and screen every address the name maps to. Port is
    // irrelevant for lookup but required by the resolver API.
    let addrs = tokio::net::lookup_host((lowered.as_str(), 443))
        .await
        .map_err(|e| Error::DeliveryBlocked(format!("host {host:?} did not resolve: {e}")))?;
    let mut any = false;
    for addr in addrs {
        any = true;
        check_ip(addr.ip(), host)?;
    }
    if !any {
        return Err(Error::DeliveryBlocked(format!(
            "host {host:?} resolved to no addresses"
        )));
    }
    Ok(())
}

fn check_ip(ip: IpAddr, host: &str) -> Result<()> {
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    };
    if blocked {
        return Err(Error::DeliveryBlocked(format!(
            "host {host:?} resolves to non-routable address {ip}"
        )));
    }
    Ok(())
}

/// Per-destination rolling-window rate limiter.
///
/// Tracks send timestamps per (destination id, event name). A send past
/// [`FLOOD_LIMIT`] within the window is refused; refused sends are
/// dropped, not queued.
pub struct FloodGuard {
    windows: Mutex<HashMap<(Uuid, String), Vec<DateTime<Utc>>>>,
}

impl FloodGuard {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an intended send at `now`. Returns `true` if the send is
    /// within budget, `false` if the destination is flooded.
    pub fn admit(&self, destination: Uuid, event: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - Duration::seconds(FLOOD_WINDOW_SECS);
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            // A poisoned window map only means a panic mid-update; the
            // timestamps themselves are still usable.
            Err(poisoned) => poisoned.into_inner(),
        };
        // Drop windows that have fully aged out, so the map does not
        // grow with destinations that no longer receive events.
        windows.retain(|_, timestamps| timestamps.iter().any(|t| *t > cutoff));
        let window = windows
            .entry((destination, event.to_string()))
            .or_default();
        window.retain(|t| *t > cutoff);
        if window.len() >= FLOOD_LIMIT {
            return false;
        }
        window.push(now);
        true
    }
}

impl Default for FloodGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_guard_admits_up_to_limit() {
        let guard = FloodGuard::new();
        let dest = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..FLOOD_LIMIT {
            assert!(guard.admit(dest, "work.assigned", now));
        }
        assert!(!guard.admit(dest, "work.assigned", now));
        // Different event name has its own window.
        assert!(guard.admit(dest, "work.completed", now));
    }

    #[test]
    fn flood_guard_window_slides() {
        let guard = FloodGuard::new();
        let dest = Uuid::new_v4();
        let start = Utc::now();
        for _ in 0..FLOOD_LIMIT {
            assert!(guard.admit(dest, "work.failed", start));
        }
        assert!(!guard.admit(dest, "work.failed", start));
        let later = start + Duration::seconds(FLOOD_WINDOW_SECS + 1);
        assert!(guard.admit(dest, "work.failed", later));
    }

    #[test]
    fn flood_guard_sweeps_aged_out_destinations() {
        let guard = FloodGuard::new();
        let start = Utc::now();
        assert!(guard.admit(Uuid::new_v4(), "work.assigned", start));
        assert!(guard.admit(Uuid::new_v4(), "work.completed", start));

        // Once the window has passed, an admit for a new destination
        // leaves no trace of the old ones.
        let later = start + Duration::seconds(FLOOD_WINDOW_SECS + 1);
        assert!(guard.admit(Uuid::new_v4(), "work.failed", later));
        let windows = match guard.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        assert_eq!(windows.len(), 1);
    }
}
