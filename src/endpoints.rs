//! Endpoint descriptors and cache keys.
//!
//! Wrappers here are pure data: a method, a path, a body and, for calls
//! known to be slow, a longer timeout. Deadlines, retries and error shapes
//! are the pipeline's job.

use std::time::Duration;

use serde_json::json;

use crate::api::RequestDescriptor;
use crate::cache::CacheKey;

/// Heavy aggregate queries.
pub const SLOW_TIMEOUT: Duration = Duration::from_millis(20_000);
/// Generative calls (AI-written bios, post drafts).
pub const GENERATIVE_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Auth
// ============================================================================

pub mod auth {
  use super::*;

  pub fn request_code(email: &str) -> RequestDescriptor {
    RequestDescriptor::post("/auth/request-code").json(json!({ "email": email }))
  }

  pub fn verify(email: &str, code: &str) -> RequestDescriptor {
    RequestDescriptor::post("/auth/verify").json(json!({ "email": email, "code": code }))
  }

  pub fn logout() -> RequestDescriptor {
    RequestDescriptor::post("/auth/logout")
  }

  pub fn delete_account() -> RequestDescriptor {
    RequestDescriptor::delete("/auth/account")
  }
}

// ============================================================================
// Creator surface
// ============================================================================

pub mod creator {
  use super::*;

  pub fn profile() -> RequestDescriptor {
    RequestDescriptor::get("/creator/profile")
  }

  pub fn update_profile(changes: serde_json::Value) -> RequestDescriptor {
    RequestDescriptor::patch("/creator/profile").json(changes)
  }

  pub fn metrics(range: &str) -> RequestDescriptor {
    RequestDescriptor::get(format!("/creator/metrics?range={}", range))
  }

  pub fn subscriptions(page: u32) -> RequestDescriptor {
    RequestDescriptor::get(format!("/creator/subscriptions?page={}", page))
  }

  /// Public creator page; an anonymous 401 here is expected.
  pub fn public_page(handle: &str) -> RequestDescriptor {
    RequestDescriptor::get(format!("/public/creators/{}", handle))
  }

  pub fn generate_bio(prompt: &str) -> RequestDescriptor {
    RequestDescriptor::post("/creator/ai/bio")
      .json(json!({ "prompt": prompt }))
      .with_timeout(GENERATIVE_TIMEOUT)
  }
}

// ============================================================================
// Admin surface
// ============================================================================

pub mod admin {
  use super::*;

  pub fn dashboard() -> RequestDescriptor {
    RequestDescriptor::get("/admin/dashboard").with_timeout(SLOW_TIMEOUT)
  }

  pub fn creators(page: u32) -> RequestDescriptor {
    RequestDescriptor::get(format!("/admin/creators?page={}", page))
  }

  pub fn payouts_report(month: &str) -> RequestDescriptor {
    RequestDescriptor::get(format!("/admin/reports/payouts?month={}", month))
      .with_timeout(SLOW_TIMEOUT)
  }
}

// ============================================================================
// Cache keys
// ============================================================================

pub mod keys {
  use super::*;

  pub const PROFILE: &str = "profile";
  pub const METRICS: &str = "metrics";
  pub const SUBSCRIPTIONS: &str = "subscriptions";
  pub const ADMIN_DASHBOARD: &str = "admin-dashboard";

  pub fn profile() -> CacheKey {
    CacheKey::new(PROFILE)
  }

  pub fn metrics(range: &str) -> CacheKey {
    CacheKey::new(METRICS).with(range)
  }

  pub fn subscriptions(page: u32) -> CacheKey {
    CacheKey::new(SUBSCRIPTIONS).with(page)
  }

  pub fn admin_dashboard() -> CacheKey {
    CacheKey::new(ADMIN_DASHBOARD)
  }

  /// Cache key for an ad-hoc path, e.g. from the command line.
  pub fn for_path(path: &str) -> CacheKey {
    let mut segments = path.trim_matches('/').split('/').filter(|s| !s.is_empty());
    let root = segments.next().unwrap_or("root");
    segments.fold(CacheKey::new(root), |key, segment| key.with(segment))
  }
}
