//! User identity shape and display color assignment.
//!
//! Identity is supplied by an external collaborator (auth/session layer) for
//! authenticated users, or generated locally for anonymous ones. This module
//! only consumes the `{id, display_name, avatar_ref}` shape — it never
//! validates or authorizes anything.
//!
//! Display colors are derived deterministically from the *stable* user id,
//! so a user keeps the same color across sessions and devices, and a color
//! is never reassigned mid-session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a local user, as supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Stable user id (authenticated id, or a generated anonymous id).
    pub id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    /// Generate an anonymous identity for unauthenticated clients.
    ///
    /// The caller is expected to persist this client-side so the same
    /// anonymous user keeps a stable id (and therefore a stable color).
    pub fn anonymous() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("anon-{token}"),
            display_name: format!("Guest-{}", &token[..8]),
            avatar_ref: None,
        }
    }
}

/// RGBA color assigned to a participant for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticipantColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ParticipantColor {
    /// Derive a stable, visually distinct color from a stable user id.
    ///
    /// FNV-1a hash of the id selects a hue; saturation and lightness are
    /// fixed high so cursors stay vivid against document text.
    pub fn from_user_id(user_id: &str) -> Self {
        let hash = fnv1a(user_id.as_bytes());
        let hue = (hash % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// `#rrggbb` form for the editor surface.
    pub fn to_hex(&self) -> String {
        format!(
            "#{:02x}{:02x}{:02x}",
            (self.r.clamp(0.0, 1.0) * 255.0) as u8,
            (self.g.clamp(0.0, 1.0) * 255.0) as u8,
            (self.b.clamp(0.0, 1.0) * 255.0) as u8,
        )
    }
}

impl Default for ParticipantColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

/// Connection-scoped profile announced to peers on join.
///
/// `client_id` is the per-connection ephemeral identifier; the stable user
/// identity travels inside. One user reconnecting gets a fresh `client_id`
/// but keeps the same `user_id` and color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub client_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub color: ParticipantColor,
}

impl ParticipantProfile {
    pub fn new(client_id: Uuid, identity: &UserIdentity) -> Self {
        Self {
            client_id,
            user_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            avatar_ref: identity.avatar_ref.clone(),
            color: ParticipantColor::from_user_id(&identity.id),
        }
    }
}

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// HSL to RGB conversion.
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
