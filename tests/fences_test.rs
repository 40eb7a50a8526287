mod helpers;

use helpers::*;
use serde_json::json;

use trackstore::cache::keys::GLOBAL_OWNER;
use trackstore::fences::{self, FenceEvent, Waypoint};
use trackstore::ingest::{InboundMessage, IngestOutcome, Recorder};

const HOME: (f64, f64) = (52.0, 5.0);

fn import_home(rec: &Recorder) {
    let payload = json!({
        "_type": "waypoints",
        "waypoints": [{"_type": "waypoint", "desc": "Home", "lat": HOME.0, "lon": HOME.1, "rad": 100, "tst": T0}],
    });
    let msg = InboundMessage::new("owntracks/jane/phone/waypoints", payload.to_string());
    assert_eq!(rec.handle(&msg), IngestOutcome::Waypoints { loaded: 1 });
}

/// Publish a fix `meters` north of home and return its transitions.
fn fix_at(rec: &Recorder, tst: i64, meters: f64) -> Vec<FenceEvent> {
    let msg = InboundMessage::new("owntracks/jane/phone", location(tst, north(HOME.0, meters), HOME.1));
    match rec.handle_at(&msg, tst) {
        IngestOutcome::Located { transitions, .. } => transitions.iter().map(|t| t.event).collect(),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn approach_enter_stay_leave() {
    let (_dir, rec) = test_recorder();
    let notifier = RecordingNotifier::default();
    let rec = rec.with_notifier(notifier.clone());
    import_home(&rec);

    assert!(fix_at(&rec, T0, 150.0).is_empty());
    assert_eq!(fix_at(&rec, T0 + 60, 50.0), vec![FenceEvent::Enter]);
    assert!(fix_at(&rec, T0 + 120, 40.0).is_empty());
    assert!(fix_at(&rec, T0 + 180, 99.0).is_empty());
    assert_eq!(fix_at(&rec, T0 + 240, 200.0), vec![FenceEvent::Leave]);
    assert!(fix_at(&rec, T0 + 300, 250.0).is_empty());

    let seen = notifier.transitions.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].event, FenceEvent::Enter);
    assert_eq!(seen[0].desc, "Home");
    assert_eq!((seen[0].owner_user.as_str(), seen[0].owner_device.as_str()), ("jane", "phone"));
    assert!((seen[0].dist - 50.0).abs() < 1.0, "dist {}", seen[0].dist);
    assert_eq!(seen[1].event, FenceEvent::Leave);
}

#[test]
fn fence_state_survives_reimport() {
    let (_dir, rec) = test_recorder();
    import_home(&rec);
    assert_eq!(fix_at(&rec, T0, 10.0), vec![FenceEvent::Enter]);

    // the phone republishes its waypoint list while inside
    import_home(&rec);
    assert!(fix_at(&rec, T0 + 60, 20.0).is_empty());
    assert_eq!(fix_at(&rec, T0 + 120, 500.0), vec![FenceEvent::Leave]);
}

#[test]
fn global_fences_apply_to_every_device() {
    let (_dir, rec) = test_recorder();
    let office = Waypoint {
        lat: HOME.0,
        lon: HOME.1,
        rad: 300.0,
        desc: "Office".into(),
        io: false,
    };
    fences::put_waypoint(rec.cache(), GLOBAL_OWNER.0, GLOBAL_OWNER.1, office, rec.precision());

    let msg = InboundMessage::new("owntracks/john/car", location(T0, HOME.0, HOME.1));
    match rec.handle_at(&msg, T0) {
        IngestOutcome::Located { transitions, .. } => {
            assert_eq!(transitions.len(), 1);
            assert_eq!(transitions[0].event, FenceEvent::Enter);
            assert_eq!(transitions[0].owner_user, GLOBAL_OWNER.0);
            assert_eq!(transitions[0].desc, "Office");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let stored = fences::list_waypoints(rec.cache(), GLOBAL_OWNER.0, GLOBAL_OWNER.1);
    assert_eq!(stored.len(), 1);
    assert!(stored[0].1.io);
}

#[test]
fn other_owners_fences_are_ignored() {
    let (_dir, rec) = test_recorder();
    import_home(&rec);

    let msg = InboundMessage::new("owntracks/john/car", location(T0, HOME.0, HOME.1));
    match rec.handle_at(&msg, T0) {
        IngestOutcome::Located { transitions, .. } => assert!(transitions.is_empty()),
        other => panic!("unexpected outcome {other:?}"),
    }
}
