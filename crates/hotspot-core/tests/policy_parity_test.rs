//! Policy parity contract.
//!
//! `fixtures/policy_parity.json` is the shared table of (user state,
//! settings) cases and the decisions every consumer must agree on. Each case
//! is checked against status, frontend token, binding type, hard-block and
//! bypass.
#![allow(clippy::unwrap_used)]

use std::str::FromStr;

use chrono::{Duration, Utc};
use hotspot_core::model::{ApprovalStatus, User, normalize_to_e164};
use hotspot_core::policy::{
    AccessStatus, PolicyConfig, access_status, allowed_binding_type,
    is_network_hard_block_required, should_bypass_hotspot_login,
};
use rust_decimal::Decimal;
use serde::Deserialize;

const CONTRACT: &str = include_str!("fixtures/policy_parity.json");

#[derive(Deserialize)]
struct Contract {
    defaults: SettingsCase,
    cases: Vec<Case>,
}

#[derive(Deserialize, Default)]
struct SettingsCase {
    fup_threshold_mb: Option<i64>,
    bypass_statuses: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct Case {
    name: String,
    user: UserCase,
    #[serde(default)]
    settings: SettingsCase,
    expect: Expected,
}

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
struct UserCase {
    purchased_mb: i64,
    used_mb: Decimal,
    expiry_days: Option<i64>,
    #[serde(default)]
    is_unlimited: bool,
    #[serde(default = "yes")]
    is_active: bool,
    approval: Option<String>,
    #[serde(default)]
    is_blocked: bool,
    blocked_reason: Option<String>,
}

#[derive(Deserialize)]
struct Expected {
    status: String,
    frontend: String,
    binding: String,
    hard_block: bool,
    bypass: bool,
}

fn statuses(raw: &[String]) -> Vec<AccessStatus> {
    raw.iter()
        .map(|s| AccessStatus::from_str(s).unwrap())
        .collect()
}

fn policy_for(defaults: &SettingsCase, case: &SettingsCase) -> PolicyConfig {
    PolicyConfig {
        fup_threshold_mb: case
            .fup_threshold_mb
            .or(defaults.fup_threshold_mb)
            .unwrap(),
        bypass_statuses: statuses(
            case.bypass_statuses
                .as_ref()
                .or(defaults.bypass_statuses.as_ref())
                .unwrap(),
        ),
    }
}

fn user_for(case: &UserCase) -> User {
    let now = Utc::now();
    let mut user = User::new(normalize_to_e164("081200000042").unwrap(), "Parity", now);
    user.is_active = case.is_active;
    user.approval_status = case
        .approval
        .as_deref()
        .map_or(ApprovalStatus::Approved, |a| {
            ApprovalStatus::from_str(a).unwrap()
        });
    user.purchased_mb = case.purchased_mb;
    user.used_mb = case.used_mb;
    user.expiry = case.expiry_days.map(|days| now + Duration::days(days));
    user.is_unlimited = case.is_unlimited;
    user.is_blocked = case.is_blocked;
    user.blocked_reason.clone_from(&case.blocked_reason);
    user
}

#[test]
fn every_parity_case_holds() {
    let contract: Contract = serde_json::from_str(CONTRACT).unwrap();
    assert!(!contract.cases.is_empty());

    let mut failures = Vec::new();
    for case in &contract.cases {
        let now = Utc::now();
        let user = user_for(&case.user);
        let policy = policy_for(&contract.defaults, &case.settings);

        let status = access_status(&user, &policy, now);
        let actual = (
            status.to_string(),
            status.frontend_token().to_owned(),
            allowed_binding_type(&user, &policy, now).as_str().to_owned(),
            is_network_hard_block_required(&user),
            should_bypass_hotspot_login(&user, &policy, now),
        );
        let expected = (
            case.expect.status.clone(),
            case.expect.frontend.clone(),
            case.expect.binding.clone(),
            case.expect.hard_block,
            case.expect.bypass,
        );
        if actual != expected {
            failures.push(format!("{}: expected {expected:?}, got {actual:?}", case.name));
        }
    }
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}

#[test]
fn contract_covers_every_status() {
    let contract: Contract = serde_json::from_str(CONTRACT).unwrap();
    for status in [
        AccessStatus::Active,
        AccessStatus::Fup,
        AccessStatus::Habis,
        AccessStatus::Expired,
        AccessStatus::Unlimited,
        AccessStatus::Inactive,
        AccessStatus::Blocked,
    ] {
        assert!(
            contract
                .cases
                .iter()
                .any(|c| c.expect.status == status.to_string()),
            "no parity case for {status}"
        );
    }
}

#[test]
fn frontend_mapping_preserves_the_status_set() {
    let contract: Contract = serde_json::from_str(CONTRACT).unwrap();
    for case in &contract.cases {
        let status = AccessStatus::from_str(&case.expect.status).unwrap();
        let folded = matches!(status, AccessStatus::Active | AccessStatus::Unlimited);
        assert_eq!(case.expect.frontend == "ok", folded, "{}", case.name);
    }
}
