// tests/lifecycle_scenarios.rs
//
// End-to-end scenarios for the commitment lifecycle arithmetic, exercised
// against the engine's planning helpers without a live database. The
// literal numbers mirror the operator-facing examples in the product docs.

use chrono::{DateTime, TimeZone, Utc};
use shared::commitment::{
    check_conversion_amounts, conversion_rate, merge_values, mint_transfer_token, split_amounts,
    split_values,
};
use shared::models::{CommitmentStatus, ProjectCommitment, TransferStatus};
use shared::quota::{
    check_commitment_delta, check_transfer, CapacityCheckInput, ProjectFloor,
};
use shared::QuotaError;
use uuid::Uuid;

fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
}

fn confirmed(amount: i64, duration: &str, expires_at: DateTime<Utc>) -> ProjectCommitment {
    ProjectCommitment {
        id: 1,
        uuid: Uuid::new_v4(),
        az_resource_id: 10,
        amount,
        duration: duration.to_string(),
        created_at: at(2026, 5, 1, 8),
        creator_uuid: Uuid::new_v4(),
        creator_name: "alice".into(),
        confirm_by: None,
        confirmed_at: Some(at(2026, 5, 1, 8)),
        expires_at,
        status: CommitmentStatus::Confirmed,
        transfer_status: TransferStatus::None,
        transfer_token: None,
        predecessor_id: None,
        creation_context: serde_json::json!({"reason": "create"}),
        supersede_context: None,
        notify_on_confirm: false,
    }
}

// ── Scenario: capacity invariant blocks immediate confirmation ────────────

#[test]
fn capacity_invariant_blocks_follow_up_commitment() {
    // compute/cores in az-one: capacity 10, berlin usage 2, others usage 4.
    let mut cell = CapacityCheckInput {
        raw_capacity: 10,
        enforced: true,
        projects: vec![
            ProjectFloor {
                az_resource_id: 1, // berlin
                committed: 0,
                usage: 2,
            },
            ProjectFloor {
                az_resource_id: 2, // everyone else
                committed: 0,
                usage: 4,
            },
        ],
    };

    // Creating amount=6 for berlin fits exactly: max(6, 2) + 4 = 10.
    assert!(check_commitment_delta(&cell, 1, 6).is_ok());

    // Once that is confirmed, one more unit is over capacity.
    cell.projects[0].committed = 6;
    let err = check_commitment_delta(&cell, 1, 1).unwrap_err();
    assert!(matches!(err, QuotaError::CapacityExceeded(_)));
}

// ── Scenario: split then transfer round-trip ──────────────────────────────

#[test]
fn split_carves_exact_transfer_amount() {
    let original = confirmed(10, "1 hour", at(2026, 5, 1, 9));
    let (carved, rest) = split_values(&original, 9).unwrap();
    assert_eq!(carved.amount, 9);
    assert_eq!(rest.amount, 1);
    assert_eq!(carved.expires_at, original.expires_at);
    assert_eq!(carved.status, CommitmentStatus::Confirmed);
}

#[test]
fn transfer_token_has_the_documented_format() {
    let token = mint_transfer_token();
    assert_eq!(token.len(), 48);
    assert!(token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
}

#[test]
fn transfer_to_other_project_preserves_capacity_invariant() {
    // Two projects on one AZ cell with capacity 20; berlin holds a
    // confirmed commitment of 9 and dresden is idle.
    let cell = CapacityCheckInput {
        raw_capacity: 20,
        enforced: true,
        projects: vec![
            ProjectFloor {
                az_resource_id: 1, // berlin
                committed: 9,
                usage: 2,
            },
            ProjectFloor {
                az_resource_id: 2, // dresden
                committed: 0,
                usage: 4,
            },
        ],
    };
    // Moving the 9 to dresden: 2 + max(9, 4) = 11 <= 20.
    assert!(check_transfer(&cell, 1, 2, 9).is_ok());

    // With dresden already near capacity the move is rejected.
    let tight = CapacityCheckInput {
        raw_capacity: 13,
        ..cell.clone()
    };
    assert!(check_transfer(&tight, 1, 2, 9).is_ok());
    let too_tight = CapacityCheckInput {
        raw_capacity: 10,
        ..cell
    };
    assert!(matches!(
        check_transfer(&too_tight, 1, 2, 9),
        Err(QuotaError::CapacityExceeded(_))
    ));
}

// ── Scenario: conversion with remainder rejected ──────────────────────────

#[test]
fn conversion_rejects_amounts_that_do_not_fit_the_rate() {
    // Source weight 48, target weight 32 reduce to from=3, to=2.
    let (from, to) = conversion_rate(48, 32);
    assert_eq!((from, to), (3, 2));

    let err = check_conversion_amounts(10, 6, from, to).unwrap_err();
    match err {
        QuotaError::Conflict(message) => {
            assert_eq!(message, "amount 10 does not fit into conversion rate 3");
        }
        other => panic!("expected Conflict, got {:?}", other),
    }

    assert!(check_conversion_amounts(3, 2, from, to).is_ok());
}

// ── Scenario: merge consolidates expiry to the latest ─────────────────────

#[test]
fn merge_consolidates_to_latest_expiry() {
    let mut one_hour = confirmed(10, "1 hour", at(2026, 5, 1, 9));
    one_hour.id = 1;
    let mut two_hours = confirmed(5, "2 hours", at(2026, 5, 1, 10));
    two_hours.id = 2;

    let merged = merge_values(&[one_hour, two_hours]).unwrap();
    assert_eq!(merged.amount, 15);
    assert_eq!(merged.expires_at, at(2026, 5, 1, 10));
    assert_eq!(merged.duration, "2 hours");
}

// ── Property: amounts are conserved across split chains ───────────────────

#[test]
fn split_chains_conserve_total_amount() {
    let mut amounts = vec![100u64];
    // Repeatedly split the largest piece and check the running total.
    for carve in [40u64, 25, 10, 5, 1] {
        amounts.sort_unstable();
        let largest = amounts.pop().unwrap();
        let (a, b) = split_amounts(largest, carve).unwrap();
        amounts.push(a);
        amounts.push(b);
        assert_eq!(amounts.iter().sum::<u64>(), 100);
    }
}
