mod common;

use common::*;
use portal_calls::calls::media::{PeerConnection, PeerConnectionState};
use portal_calls::calls::mock::ToneAction;
use portal_calls::calls::{
    CallError, CallEvent, CallManagerConfig, CallOptions, CallState, DeviceError, DeviceKind,
    DeviceSet, GlarePolicy, IceCandidate, LocalRelay, MediaFailure, PermissionState, RelayAction,
    SessionDescription, SignalType, Tone, is_valid_history,
};
use portal_calls::types::call::{CallId, CallKind, EndReason};
use std::time::Duration;

fn hold(
    signal_type: SignalType,
) -> impl Fn(&portal_calls::calls::CallSignal) -> RelayAction + Send + Sync + 'static {
    move |signal| {
        if signal.signal_type == signal_type {
            RelayAction::Hold
        } else {
            RelayAction::Deliver
        }
    }
}

fn has_candidate_from(candidates: &[IceCandidate], label: &str) -> bool {
    candidates
        .iter()
        .any(|c| c.candidate.ends_with(&format!("ufrag {label}")))
}

#[tokio::test]
async fn test_video_call_connects_and_ends() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let call_id = alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    alice.wait_for_state("dialing").await;

    let (incoming, from, kind) = bob.wait_for_incoming().await;
    assert_eq!(incoming, call_id);
    assert_eq!(from, "alice");
    assert_eq!(kind, CallKind::Video);
    assert!(
        bob.devices.requests().is_empty(),
        "ringing must not touch the camera or microphone"
    );

    bob.handle.accept().await.unwrap();
    bob.wait_for_state("active").await;
    alice.wait_for_state("active").await;

    assert_eq!(
        sent_by(&relay, "alice"),
        vec![SignalType::CallRequest, SignalType::Offer]
    );
    assert_eq!(
        sent_by(&relay, "bob"),
        vec![SignalType::CallAccepted, SignalType::Answer]
    );
    let request = relay
        .sent_signals()
        .into_iter()
        .find(|s| s.signal_type == SignalType::CallRequest)
        .unwrap();
    assert_eq!(request.data.kind, Some(CallKind::Video));
    assert_eq!(request.call_id, call_id);

    let alice_peer = alice.peers.last().unwrap();
    let bob_peer = bob.peers.last().unwrap();
    eventually("candidates applied on both sides", || {
        has_candidate_from(&bob_peer.applied_candidates(), "alice")
            && has_candidate_from(&alice_peer.applied_candidates(), "bob")
    })
    .await;
    assert_eq!(alice_peer.attached_tracks(), 2);

    assert_eq!(
        alice.tones.actions(),
        vec![ToneAction::Start(Tone::Ringback), ToneAction::Stop]
    );
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone), ToneAction::Stop]
    );

    let live = alice.handle.current_call().await.unwrap();
    assert!(live.state.is_active());
    assert_eq!(live.id, call_id);

    alice.handle.end_call().await.unwrap();
    let (reason, message) = bob.wait_for_ended().await;
    assert_eq!(reason, EndReason::RemoteEnded);
    assert_eq!(message, "The other participant ended the call");

    let last = alice.handle.last_call().await.unwrap();
    assert_eq!(
        last.history,
        vec!["idle", "dialing", "negotiating", "active", "ended"]
    );
    assert!(matches!(
        last.state,
        CallState::Ended {
            reason: EndReason::LocalHangup,
            duration_secs: Some(_),
            ..
        }
    ));
    assert_eq!(
        bob.history().await,
        vec!["idle", "ringing", "negotiating", "active", "ended"]
    );
    assert!(is_valid_history(&bob.history().await));
    assert!(alice.handle.current_call().await.is_none());

    for p in [&alice, &bob] {
        assert!(p.devices.live_tracks().is_empty(), "{} kept a device", p.id);
        let peer = p.peers.last().unwrap();
        assert_eq!(peer.close_count(), 1);
        assert_eq!(peer.connection_state(), PeerConnectionState::Closed);
    }
}

#[tokio::test]
async fn test_toggles_report_local_media_without_renegotiating() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;
    let call_id = connect(&mut alice, &mut bob, CallKind::Video).await;

    assert!(!alice.handle.toggle_mute().await.unwrap());
    let event = alice
        .wait_for_event(|e| matches!(e, CallEvent::LocalMediaChanged { .. }))
        .await;
    match event {
        CallEvent::LocalMediaChanged {
            call_id: id,
            audio_enabled,
            video_enabled,
        } => {
            assert_eq!(id, call_id);
            assert!(!audio_enabled);
            assert!(video_enabled);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(!alice.handle.toggle_video().await.unwrap());
    assert!(alice.handle.toggle_mute().await.unwrap());
    assert_eq!(alice.peers.last().unwrap().negotiation_count(), 1);
    assert!(alice.handle.current_call().await.unwrap().state.is_active());
}

#[tokio::test]
async fn test_candidates_before_offer_are_replayed() {
    let relay = LocalRelay::new();
    relay.set_filter(hold(SignalType::Offer));
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    bob.wait_for_incoming().await;
    eventually("alice's candidate to reach the relay", || {
        count_sent(&relay, "alice", SignalType::IceCandidate) >= 1
    })
    .await;

    bob.handle.accept().await.unwrap();
    bob.wait_for_state("negotiating").await;
    eventually("bob's peer connection", || bob.peers.last().is_some()).await;
    let peer = bob.peers.last().unwrap();
    assert!(peer.remote_description().is_none());
    assert!(peer.applied_candidates().is_empty());

    relay.clear_filter();
    assert_eq!(relay.release_held(), 1);

    bob.wait_for_state("active").await;
    alice.wait_for_state("active").await;
    eventually("buffered candidate applied after the offer", || {
        has_candidate_from(&peer.applied_candidates(), "alice")
    })
    .await;
}

#[tokio::test]
async fn test_offer_before_request_is_applied_after_accept() {
    let relay = LocalRelay::new();
    relay.set_filter(hold(SignalType::CallRequest));
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let call_id = alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    eventually("alice's offer and candidate to reach bob first", || {
        count_sent(&relay, "alice", SignalType::Offer) == 1
            && count_sent(&relay, "alice", SignalType::IceCandidate) >= 1
    })
    .await;
    assert!(bob.handle.current_call().await.is_none());

    relay.clear_filter();
    assert_eq!(relay.release_held(), 1);
    let (incoming, _, _) = bob.wait_for_incoming().await;
    assert_eq!(incoming, call_id);
    bob.handle.accept().await.unwrap();

    bob.wait_for_state("active").await;
    alice.wait_for_state("active").await;
    let peer = bob.peers.last().unwrap();
    assert!(peer.remote_description().is_some());
    eventually("early candidate applied after the offer", || {
        has_candidate_from(&peer.applied_candidates(), "alice")
    })
    .await;
}

#[tokio::test]
async fn test_end_before_request_never_rings() {
    let relay = LocalRelay::new();
    let alice = ScriptedPeer::new("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let abandoned = CallId::generate();
    alice
        .send(alice.signal(SignalType::CallEnded, &abandoned, "bob").build())
        .await;
    alice
        .send(
            alice
                .signal(SignalType::CallRequest, &abandoned, "bob")
                .kind(CallKind::Audio)
                .build(),
        )
        .await;

    let fresh = CallId::generate();
    alice
        .send(
            alice
                .signal(SignalType::CallRequest, &fresh, "bob")
                .kind(CallKind::Audio)
                .build(),
        )
        .await;
    let (incoming, _, _) = bob.wait_for_incoming().await;
    assert_eq!(incoming, fresh);
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone)]
    );
}

#[tokio::test]
async fn test_rejected_remote_candidate_ends_call() {
    let relay = LocalRelay::new();
    let alice = ScriptedPeer::new("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let call_id = CallId::generate();
    alice
        .send(
            alice
                .signal(SignalType::CallRequest, &call_id, "bob")
                .kind(CallKind::Audio)
                .build(),
        )
        .await;
    bob.wait_for_incoming().await;
    alice
        .send(
            alice
                .signal(SignalType::IceCandidate, &call_id, "bob")
                .candidate(IceCandidate::new("not a candidate"))
                .build(),
        )
        .await;
    alice
        .send(
            alice
                .signal(SignalType::Offer, &call_id, "bob")
                .offer(SessionDescription::offer("v=0\r\no=alice 1 1 IN IP4 127.0.0.1\r\n"))
                .build(),
        )
        .await;
    bob.handle.accept().await.unwrap();

    let (reason, _) = bob.wait_for_ended().await;
    assert!(matches!(reason, EndReason::NegotiationFailed(_)));
    assert_eq!(alice.wait_for(SignalType::CallEnded).await.call_id, call_id);
    assert!(bob.devices.live_tracks().is_empty());
    assert_eq!(bob.peers.last().unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_decline_never_touches_callee_devices() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    bob.wait_for_incoming().await;
    bob.handle.decline().await.unwrap();

    let (reason, message) = alice.wait_for_ended().await;
    assert_eq!(reason, EndReason::RemoteRejected);
    assert_eq!(message, "Call was declined");
    assert_eq!(alice.history().await, vec!["idle", "dialing", "ended"]);
    assert_eq!(bob.history().await, vec!["idle", "ringing", "ended"]);
    assert!(matches!(
        bob.handle.last_call().await.unwrap().state,
        CallState::Ended {
            reason: EndReason::Declined,
            duration_secs: None,
            ..
        }
    ));

    assert!(bob.devices.requests().is_empty());
    assert!(bob.peers.created().is_empty());
    assert_eq!(sent_by(&relay, "bob"), vec![SignalType::CallRejected]);
    assert!(alice.devices.live_tracks().is_empty());
    assert_eq!(alice.peers.last().unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_denied_permission_sends_nothing() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let bob = participant("bob", &relay).await;
    alice
        .devices
        .set_permission(DeviceKind::Camera, PermissionState::Denied);

    alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    let (reason, message) = alice.wait_for_ended().await;

    let guidance = MediaFailure::PermissionDenied {
        devices: DeviceSet::Camera,
    }
    .remediation();
    assert_eq!(reason, EndReason::MediaUnavailable(guidance.clone()));
    assert_eq!(message, guidance);
    assert_eq!(alice.history().await, vec!["idle", "dialing", "ended"]);

    assert!(relay.sent_signals().is_empty());
    assert!(alice.devices.requests().is_empty());
    assert!(alice.peers.created().is_empty());
    assert!(bob.handle.current_call().await.is_none());
    assert!(bob.handle.last_call().await.is_none());
}

#[tokio::test]
async fn test_busy_device_ends_call_with_guidance() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    alice.devices.push_failure(DeviceError::NotReadable);

    alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    let (reason, _) = alice.wait_for_ended().await;

    assert_eq!(
        reason,
        EndReason::MediaUnavailable(MediaFailure::DeviceBusy.remediation())
    );
    assert_eq!(alice.devices.requests().len(), 1);
    assert!(alice.devices.live_tracks().is_empty());
    assert!(relay.sent_signals().is_empty());
}

#[tokio::test]
async fn test_callee_media_failure_rejects_call() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;
    bob.devices.push_failure(DeviceError::NotFound);

    alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    bob.wait_for_incoming().await;
    bob.handle.accept().await.unwrap();

    let (reason, _) = bob.wait_for_ended().await;
    assert_eq!(
        reason,
        EndReason::MediaUnavailable(MediaFailure::DeviceNotFound.remediation())
    );
    let (reason, _) = alice.wait_for_ended().await;
    assert_eq!(reason, EndReason::RemoteRejected);

    assert_eq!(
        bob.history().await,
        vec!["idle", "ringing", "negotiating", "ended"]
    );
    assert_eq!(sent_by(&relay, "bob"), vec![SignalType::CallRejected]);
    assert!(alice.devices.live_tracks().is_empty());
}

#[tokio::test]
async fn test_hangup_mid_negotiation_ignores_late_answer() {
    let relay = LocalRelay::new();
    relay.set_filter(hold(SignalType::Answer));
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    bob.wait_for_incoming().await;
    bob.handle.accept().await.unwrap();
    alice.wait_for_state("negotiating").await;
    eventually("bob's answer to reach the relay", || {
        count_sent(&relay, "bob", SignalType::Answer) == 1
    })
    .await;

    alice.handle.end_call().await.unwrap();
    relay.clear_filter();
    assert_eq!(relay.release_held(), 1);

    let (reason, _) = bob.wait_for_ended().await;
    assert_eq!(reason, EndReason::RemoteEnded);

    // The late answer is queued ahead of this command.
    assert!(alice.handle.current_call().await.is_none());
    assert_eq!(
        alice.history().await,
        vec!["idle", "dialing", "negotiating", "ended"]
    );
    let peer = alice.peers.last().unwrap();
    assert!(peer.remote_description().is_none());
    assert_eq!(peer.close_count(), 1);
    assert!(alice.devices.live_tracks().is_empty());
    eventually("alice's call-ended on the relay", || {
        count_sent(&relay, "alice", SignalType::CallEnded) == 1
    })
    .await;
}

#[tokio::test]
async fn test_remote_end_while_dialing_releases_media() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let bob = ScriptedPeer::new("bob", &relay).await;

    let call_id = alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    bob.wait_for(SignalType::Offer).await;
    assert_eq!(alice.devices.live_tracks().len(), 2);

    bob.send(bob.signal(SignalType::CallEnded, &call_id, "alice").build())
        .await;
    let (reason, _) = alice.wait_for_ended().await;

    assert_eq!(reason, EndReason::RemoteEnded);
    assert_eq!(alice.history().await, vec!["idle", "dialing", "ended"]);
    assert!(alice.devices.live_tracks().is_empty());
    assert_eq!(alice.peers.last().unwrap().close_count(), 1);
    assert_eq!(count_sent(&relay, "alice", SignalType::CallEnded), 0);
}

#[tokio::test]
async fn test_remote_reject_while_negotiating_releases_media() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let bob = ScriptedPeer::new("bob", &relay).await;

    let call_id = alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    bob.wait_for(SignalType::Offer).await;
    bob.send(
        bob.signal(SignalType::CallAccepted, &call_id, "alice")
            .kind(CallKind::Audio)
            .build(),
    )
    .await;
    alice.wait_for_state("negotiating").await;

    bob.send(bob.signal(SignalType::CallRejected, &call_id, "alice").build())
        .await;
    let (reason, _) = alice.wait_for_ended().await;

    assert_eq!(reason, EndReason::RemoteRejected);
    assert_eq!(
        alice.history().await,
        vec!["idle", "dialing", "negotiating", "ended"]
    );
    assert!(alice.devices.live_tracks().is_empty());
    assert_eq!(alice.peers.last().unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_remote_end_while_ringing_stops_ringtone() {
    let relay = LocalRelay::new();
    let alice = ScriptedPeer::new("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let call_id = CallId::generate();
    alice
        .send(
            alice
                .signal(SignalType::CallRequest, &call_id, "bob")
                .kind(CallKind::Audio)
                .build(),
        )
        .await;
    bob.wait_for_incoming().await;

    alice
        .send(alice.signal(SignalType::CallEnded, &call_id, "bob").build())
        .await;
    let (reason, _) = bob.wait_for_ended().await;

    assert_eq!(reason, EndReason::RemoteEnded);
    assert_eq!(bob.history().await, vec!["idle", "ringing", "ended"]);
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone), ToneAction::Stop]
    );
    assert!(bob.devices.requests().is_empty());
    assert!(alice.received().is_empty());
}

#[tokio::test]
async fn test_repeated_end_releases_once() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;
    connect(&mut alice, &mut bob, CallKind::Video).await;

    let (a, b, c) = tokio::join!(
        alice.handle.end_call(),
        alice.handle.end_call(),
        bob.handle.end_call()
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    alice.wait_for_ended().await;
    bob.wait_for_ended().await;

    assert!(alice.handle.current_call().await.is_none());
    assert!(bob.handle.current_call().await.is_none());
    for p in [&alice, &bob] {
        assert_eq!(p.peers.last().unwrap().close_count(), 1);
        assert!(p.devices.live_tracks().is_empty());
        assert!(count_sent(&relay, p.id.as_str(), SignalType::CallEnded) <= 1);
    }
    assert!(
        !alice
            .drain_events()
            .iter()
            .any(|e| matches!(e, CallEvent::CallEnded { .. }))
    );

    alice.handle.end_call().await.unwrap();
    assert_eq!(alice.peers.last().unwrap().close_count(), 1);
}

#[tokio::test]
async fn test_busy_participant_rejects_second_caller() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;
    let mut carol = participant("carol", &relay).await;
    connect(&mut alice, &mut bob, CallKind::Audio).await;

    carol
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    let (reason, _) = carol.wait_for_ended().await;

    assert_eq!(reason, EndReason::RemoteRejected);
    assert_eq!(carol.history().await, vec!["idle", "dialing", "ended"]);
    assert!(bob.handle.current_call().await.unwrap().state.is_active());
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone), ToneAction::Stop]
    );
    assert!(matches!(
        bob.handle.start_call("carol", CallOptions::audio()).await,
        Err(CallError::Busy(_))
    ));
}

#[tokio::test]
async fn test_crossing_requests_resolve_to_one_call() {
    let relay = LocalRelay::new();
    relay.set_filter(|_| RelayAction::Hold);
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let alice_call = alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    let bob_call = bob
        .handle
        .start_call("alice", CallOptions::audio())
        .await
        .unwrap();
    eventually("both offers on the relay", || {
        count_sent(&relay, "alice", SignalType::Offer) == 1
            && count_sent(&relay, "bob", SignalType::Offer) == 1
    })
    .await;
    relay.clear_filter();
    relay.release_held();

    // "alice" < "bob": bob yields and rings for alice's call.
    let (incoming, _, _) = bob.wait_for_incoming().await;
    assert_eq!(incoming, alice_call);
    bob.handle.accept().await.unwrap();
    alice.wait_for_state("active").await;
    bob.wait_for_state("active").await;

    assert_eq!(alice.handle.current_call().await.unwrap().id, alice_call);
    assert_eq!(bob.handle.current_call().await.unwrap().id, alice_call);

    let yielded = bob.handle.last_call().await.unwrap();
    assert_eq!(yielded.id, bob_call);
    assert!(matches!(
        yielded.state,
        CallState::Ended {
            reason: EndReason::GlareYielded,
            ..
        }
    ));
    assert_eq!(bob.peers.created()[0].close_count(), 1);
    assert_eq!(count_sent(&relay, "bob", SignalType::CallEnded), 1);
    assert!(
        !alice
            .tones
            .actions()
            .contains(&ToneAction::Start(Tone::Ringtone))
    );
}

#[tokio::test]
async fn test_glare_winner_ignores_abandoned_call() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let bob = ScriptedPeer::new("bob", &relay).await;

    let alice_call = alice
        .handle
        .start_call("bob", CallOptions::audio())
        .await
        .unwrap();
    bob.wait_for(SignalType::CallRequest).await;

    // "alice" < "bob": alice keeps dialing and bob abandons its request.
    let bob_call = CallId::generate();
    let request = bob
        .signal(SignalType::CallRequest, &bob_call, "alice")
        .kind(CallKind::Audio)
        .build();
    bob.send(request.clone()).await;
    bob.send(bob.signal(SignalType::CallEnded, &bob_call, "alice").build())
        .await;
    bob.send(request).await;
    bob.send(
        bob.signal(SignalType::CallAccepted, &alice_call, "alice")
            .kind(CallKind::Audio)
            .build(),
    )
    .await;

    let event = alice
        .wait_for_event(|e| {
            matches!(
                e,
                CallEvent::IncomingCall { .. }
                    | CallEvent::CallEnded { .. }
                    | CallEvent::StateChanged {
                        state: CallState::Negotiating { .. },
                        ..
                    }
            )
        })
        .await;
    assert!(
        matches!(event, CallEvent::StateChanged { .. }),
        "unexpected {event:?}"
    );
    assert_eq!(alice.handle.current_call().await.unwrap().id, alice_call);
    assert!(alice.handle.last_call().await.is_none());
    assert!(!bob.received().iter().any(|s| s.call_id == bob_call));
}

#[tokio::test]
async fn test_crossing_request_rejected_when_configured() {
    let relay = LocalRelay::new();
    let config = CallManagerConfig {
        glare_policy: GlarePolicy::RejectIncoming,
        ..CallManagerConfig::default()
    };
    // "bob" > "alice", so the default policy would have yielded.
    let mut bob = participant_with("bob", &relay, config).await;
    let alice = ScriptedPeer::new("alice", &relay).await;

    let bob_call = bob
        .handle
        .start_call("alice", CallOptions::video())
        .await
        .unwrap();
    alice.wait_for(SignalType::CallRequest).await;

    let alice_call = CallId::generate();
    alice
        .send(
            alice
                .signal(SignalType::CallRequest, &alice_call, "bob")
                .kind(CallKind::Video)
                .build(),
        )
        .await;
    let rejected = alice.wait_for(SignalType::CallRejected).await;
    assert_eq!(rejected.call_id, alice_call);

    alice
        .send(alice.signal(SignalType::CallEnded, &alice_call, "bob").build())
        .await;
    alice
        .send(
            alice
                .signal(SignalType::CallAccepted, &bob_call, "bob")
                .kind(CallKind::Video)
                .build(),
        )
        .await;

    let event = bob
        .wait_for_event(|e| {
            matches!(
                e,
                CallEvent::IncomingCall { .. }
                    | CallEvent::CallEnded { .. }
                    | CallEvent::StateChanged {
                        state: CallState::Negotiating { .. },
                        ..
                    }
            )
        })
        .await;
    assert!(
        matches!(event, CallEvent::StateChanged { .. }),
        "unexpected {event:?}"
    );
    assert_eq!(bob.handle.current_call().await.unwrap().id, bob_call);
    assert_eq!(count_sent(&relay, "bob", SignalType::CallRejected), 1);
    assert!(
        !bob.tones
            .actions()
            .contains(&ToneAction::Start(Tone::Ringtone))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let started = tokio::time::Instant::now();

    alice
        .handle
        .start_call("ghost", CallOptions::audio())
        .await
        .unwrap();
    let (reason, message) = alice.wait_for_ended().await;

    assert_eq!(reason, EndReason::Timeout);
    assert_eq!(message, "No answer");
    assert!(started.elapsed() >= Duration::from_secs(45));
    eventually("call-ended after the timeout", || {
        sent_by(&relay, "alice")
            == vec![
                SignalType::CallRequest,
                SignalType::Offer,
                SignalType::CallEnded,
            ]
    })
    .await;
    assert!(alice.devices.live_tracks().is_empty());
    assert_eq!(
        alice.tones.actions(),
        vec![ToneAction::Start(Tone::Ringback), ToneAction::Stop]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ring_is_missed() {
    let relay = LocalRelay::new();
    let alice = ScriptedPeer::new("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let call_id = CallId::generate();
    alice
        .send(
            alice
                .signal(SignalType::CallRequest, &call_id, "bob")
                .kind(CallKind::Video)
                .build(),
        )
        .await;
    bob.wait_for_incoming().await;
    let (reason, message) = bob.wait_for_ended().await;

    assert_eq!(reason, EndReason::Missed);
    assert_eq!(message, "Missed call");
    let rejected = alice.wait_for(SignalType::CallRejected).await;
    assert_eq!(rejected.call_id, call_id);
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone), ToneAction::Stop]
    );
    assert!(bob.devices.requests().is_empty());
}

#[tokio::test]
async fn test_duplicate_and_late_requests_do_not_ring_again() {
    let relay = LocalRelay::new();
    let alice = ScriptedPeer::new("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    let call_id = CallId::generate();
    let request = alice
        .signal(SignalType::CallRequest, &call_id, "bob")
        .kind(CallKind::Audio)
        .build();
    alice.send(request.clone()).await;
    alice.send(request.clone()).await;
    bob.wait_for_incoming().await;

    bob.handle.decline().await.unwrap();
    alice.wait_for(SignalType::CallRejected).await;
    alice.send(request).await;

    assert!(bob.handle.current_call().await.is_none());
    assert_eq!(bob.handle.last_call().await.unwrap().id, call_id);
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone), ToneAction::Stop]
    );
    assert_eq!(alice.received_types(), vec![SignalType::CallRejected]);
}

#[tokio::test]
async fn test_duplicated_signals_are_harmless() {
    let relay = LocalRelay::new();
    relay.set_filter(|_| RelayAction::Duplicate);
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;

    connect(&mut alice, &mut bob, CallKind::Audio).await;

    assert_eq!(count_sent(&relay, "bob", SignalType::Answer), 1);
    assert_eq!(count_sent(&relay, "alice", SignalType::Offer), 1);
    assert_eq!(alice.peers.created().len(), 1);
    assert_eq!(bob.peers.created().len(), 1);
    assert_eq!(
        bob.tones.actions(),
        vec![ToneAction::Start(Tone::Ringtone), ToneAction::Stop]
    );
}

#[tokio::test]
async fn test_peer_connection_failure_ends_both_sides() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;
    connect(&mut alice, &mut bob, CallKind::Audio).await;

    alice
        .peers
        .last()
        .unwrap()
        .simulate_state(PeerConnectionState::Failed);

    let (reason, message) = alice.wait_for_ended().await;
    assert_eq!(reason, EndReason::ConnectionLost);
    assert_eq!(message, "Connection lost");
    let (reason, _) = bob.wait_for_ended().await;
    assert_eq!(reason, EndReason::RemoteEnded);
    assert!(alice.devices.live_tracks().is_empty());
    assert!(bob.devices.live_tracks().is_empty());
}

#[tokio::test]
async fn test_peer_connection_setup_failure_ends_call() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    alice.peers.fail_create(true);

    alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    let (reason, _) = alice.wait_for_ended().await;

    assert!(matches!(reason, EndReason::NegotiationFailed(_)));
    assert!(relay.sent_signals().is_empty());
    assert!(alice.devices.live_tracks().is_empty());
}

#[tokio::test]
async fn test_abandoned_acquisition_is_released_before_next_call() {
    let relay = LocalRelay::new();
    let mut alice = participant("alice", &relay).await;
    let mut bob = participant("bob", &relay).await;
    alice.devices.hold();

    let first = alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    eventually("first acquisition to start", || {
        alice.devices.requests().len() == 1
    })
    .await;
    alice.handle.end_call().await.unwrap();
    let (reason, _) = alice.wait_for_ended().await;
    assert_eq!(reason, EndReason::LocalHangup);

    let second = alice
        .handle
        .start_call("bob", CallOptions::video())
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(alice.handle.current_call().await.is_some());
    assert_eq!(alice.devices.requests().len(), 1);

    alice.devices.release();
    let (incoming, _, _) = bob.wait_for_incoming().await;
    assert_eq!(incoming, second);

    assert_eq!(alice.devices.requests().len(), 2);
    assert_eq!(alice.devices.live_tracks().len(), 2);
    assert_eq!(alice.peers.created()[0].close_count(), 1);
    assert_eq!(count_sent(&relay, "alice", SignalType::CallRequest), 1);
    assert!(!relay.sent_signals().iter().any(|s| s.call_id == first));
}
