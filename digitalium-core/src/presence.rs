//! Presence rows and display identity.
//!
//! One row per `(document_id, user_id)`; rows older than a TTL are stale
//! and drop out of the active set without explicit removal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque `{from, to}` offset pair. The editor layer defines what the
/// offsets mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub from: u32,
    pub to: u32,
}

impl CursorRange {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn caret(at: u32) -> Self {
        Self { from: at, to: at }
    }
}

/// Display identity of a session's user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub name: String,
    /// `#rrggbb`, derived from `user_id`
    pub color: String,
}

impl UserIdentity {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: user_color(user_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub user_color: String,
    pub cursor_position: Option<CursorRange>,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn new(
        document_id: Uuid,
        identity: &UserIdentity,
        cursor_position: Option<CursorRange>,
        last_seen: u64,
    ) -> Self {
        Self {
            document_id,
            user_id: identity.user_id,
            user_name: identity.name.clone(),
            user_color: identity.color.clone(),
            cursor_position,
            last_seen,
        }
    }

    pub fn is_stale(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > ttl_ms
    }
}

/// Stable, vivid color for a user id.
///
/// Hue comes from the id, saturation and lightness are fixed.
pub fn user_color(user_id: Uuid) -> String {
    let hue = (user_id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
