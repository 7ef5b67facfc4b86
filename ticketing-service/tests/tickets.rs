mod common;

use common::harness;
use futures::future::{join, join_all};
use shared::TicketStatus;
use ticketing_service::checkin::TicketKind;
use ticketing_service::clock::Clock;
use ticketing_service::error::AppError;
use ticketing_service::rp::GuestRequest;
use ticketing_service::store::TicketingStore;
use uuid::Uuid;

fn guest(guest_type_id: Uuid, name: &str) -> GuestRequest {
    GuestRequest {
        guest_type_id,
        holder_name: name.to_string(),
        nickname: None,
    }
}

#[tokio::test]
async fn a_ticket_gets_in_exactly_once() {
    let h = harness().await;
    let order = h.pending_order(1).await;
    h.pay(&order).await;
    let qr = h.store.tickets_for_order(order.id).await.unwrap()[0]
        .qr_code
        .clone();

    let (a, b) = join(h.engine.check_in.check_in(&qr), h.engine.check_in.check_in(&qr)).await;
    let (admitted, rejected) = match (a, b) {
        (Ok(ticket), Err(err)) | (Err(err), Ok(ticket)) => (ticket, err),
        other => panic!("expected one admission, got {:?}", other),
    };

    assert_eq!(admitted.status, TicketStatus::Used);
    match rejected {
        AppError::AlreadyUsed { used_at } => assert_eq!(Some(used_at), admitted.used_at),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.store.get_event(h.event_id).await.unwrap().checked_in_count, 1);

    h.advance(90);
    match h.engine.check_in.check_in(&qr).await {
        Err(AppError::AlreadyUsed { used_at }) => assert_eq!(Some(used_at), admitted.used_at),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn refunded_tickets_are_turned_away() {
    let h = harness().await;
    let order = h.pending_order(1).await;
    h.pay(&order).await;
    h.engine.settlement.apply_refund(order.id).await.unwrap();
    let qr = h.store.tickets_for_order(order.id).await.unwrap()[0]
        .qr_code
        .clone();

    let err = h.engine.check_in.check_in(&qr).await.unwrap_err();
    assert!(matches!(err, AppError::TicketCancelled));
    assert_eq!(h.store.get_event(h.event_id).await.unwrap().checked_in_count, 0);
}

#[tokio::test]
async fn validation_reports_the_current_state_without_changing_it() {
    let h = harness().await;
    let order = h.pending_order(1).await;
    h.pay(&order).await;
    let qr = h.store.tickets_for_order(order.id).await.unwrap()[0]
        .qr_code
        .clone();

    let view = h.engine.check_in.validate(&qr).await.unwrap();
    assert_eq!(view.status, TicketStatus::Valid);
    assert_eq!(view.kind, TicketKind::Paid);
    assert_eq!(view.category.as_deref(), Some("General"));
    assert_eq!(view.holder_name.as_deref(), Some("Ana Torres"));
    assert_eq!(view.used_at, None);
    assert_eq!(
        h.engine.check_in.validate(&qr).await.unwrap().status,
        TicketStatus::Valid
    );

    h.engine.check_in.check_in(&qr).await.unwrap();
    let view = h.engine.check_in.validate(&qr).await.unwrap();
    assert_eq!(view.status, TicketStatus::Used);
    assert!(view.used_at.is_some());

    let err = h.engine.check_in.validate("no-such-code").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn promoter_quota_holds_under_concurrency() {
    let h = harness().await;
    let profile = h.rp_profile("LUNA", Some(5)).await;

    let results = join_all(
        (0..10).map(|i| h.engine.rp.generate("LUNA", guest(h.guest_type, &format!("Guest {}", i)))),
    )
    .await;

    let granted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::QuotaExhausted)))
        .count();
    assert_eq!(granted.len(), 5);
    assert_eq!(exhausted, 5);
    assert!(granted
        .iter()
        .all(|t| t.rp_profile_id == Some(profile.id) && t.order_id.is_none()));

    let stored = h.store.rp_profile(profile.id).await.unwrap();
    assert_eq!(stored.tickets_generated, 5);

    let info = h.engine.rp.info("LUNA").await.unwrap();
    assert_eq!(info.remaining, Some(0));
    assert_eq!(info.tickets_generated, 5);
}

#[tokio::test]
async fn inactive_expired_and_unknown_codes_are_refused() {
    let h = harness().await;

    let mut inactive = h.rp_profile("SOL", Some(5)).await;
    inactive.active = false;
    h.store.seed_rp_profile(inactive).await;

    let mut lapsed = h.rp_profile("MAR", Some(5)).await;
    lapsed.expires_at = Some(h.clock.now() - chrono::Duration::minutes(1));
    h.store.seed_rp_profile(lapsed).await;

    for code in ["SOL", "MAR", "NADIE"] {
        let err = h
            .engine
            .rp
            .generate(code, guest(h.guest_type, "Guest"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOrInactiveCode), "{}: {:?}", code, err);
        assert!(matches!(
            h.engine.rp.info(code).await,
            Err(AppError::InvalidOrInactiveCode)
        ));
    }
}

#[tokio::test]
async fn courtesy_tickets_count_attendance_for_the_promoter() {
    let h = harness().await;
    let profile = h.rp_profile("LUNA", Some(3)).await;

    let ticket = h
        .engine
        .rp
        .generate(
            "LUNA",
            GuestRequest {
                guest_type_id: h.guest_type,
                holder_name: "  Carla Ruiz ".to_string(),
                nickname: Some("La Jefa".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(ticket.holder_name.as_deref(), Some("Carla Ruiz"));

    let view = h.engine.check_in.validate(&ticket.qr_code).await.unwrap();
    assert_eq!(view.kind, TicketKind::Courtesy);
    assert_eq!(view.category.as_deref(), Some("Guest list"));
    assert_eq!(view.nickname.as_deref(), Some("La Jefa"));

    h.engine.check_in.check_in(&ticket.qr_code).await.unwrap();

    let stored = h.store.rp_profile(profile.id).await.unwrap();
    assert_eq!(stored.tickets_used, 1);
    assert_eq!(h.store.get_event(h.event_id).await.unwrap().checked_in_count, 1);

    let info = h.engine.rp.info("LUNA").await.unwrap();
    assert_eq!(info.tickets_used, 1);
    assert_eq!(info.remaining, Some(2));
    assert_eq!(info.guest_types.len(), 1);
}

#[tokio::test]
async fn guest_requests_are_validated_before_spending_quota() {
    let h = harness().await;
    let profile = h.rp_profile("LUNA", Some(2)).await;

    let cases = [
        guest(h.foreign_guest_type, "Guest"),
        guest(Uuid::new_v4(), "Guest"),
        guest(h.guest_type, "   "),
    ];
    for request in cases {
        let err = h.engine.rp.generate("LUNA", request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "unexpected {:?}", err);
    }

    let stored = h.store.rp_profile(profile.id).await.unwrap();
    assert_eq!(stored.tickets_generated, 0);
}

#[tokio::test]
async fn uncapped_promoters_never_run_out() {
    let h = harness().await;
    h.rp_profile("ABIERTO", None).await;

    for i in 0..12 {
        h.engine
            .rp
            .generate("ABIERTO", guest(h.guest_type, &format!("Guest {}", i)))
            .await
            .unwrap();
    }

    let info = h.engine.rp.info("ABIERTO").await.unwrap();
    assert_eq!(info.max_tickets, None);
    assert_eq!(info.remaining, None);
    assert_eq!(info.tickets_generated, 12);
}
