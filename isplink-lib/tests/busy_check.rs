//! Pre-send busy wait on the flow-control lines

mod common;

use common::*;

#[tokio::test(start_paused = true)]
async fn test_permanently_busy_peer_is_bounded() {
    let (isp, sim) = connected_with(
        LinkConfig::default(),
        SimBehavior {
            busy: BusyMode::Forever,
            ..Default::default()
        },
    );

    let start = Instant::now();
    let err = isp.set_u8(0x1003, 0x05).await.unwrap_err();

    assert!(
        matches!(err, IspError::BusBusyTimeout { attempts: 1000 }),
        "unexpected error: {err:?}"
    );
    assert_eq!(sim.line_samples(), 1000);
    // 10 short pauses of 1 ms, then 5 ms pauses up to the cap
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(sim.frames_received().is_empty(), "nothing may be sent on a busy bus");
    assert!(!sim.cmd_ready());
    assert_eq!(isp.last_error(), -16);
}

#[tokio::test(start_paused = true)]
async fn test_busy_cap_follows_config() {
    let retry = RetryPolicy {
        max_attempts: 20,
        ..Default::default()
    };
    let (isp, sim) = connected_with(
        LinkConfig::default().with_retry(retry),
        SimBehavior {
            busy: BusyMode::Forever,
            ..Default::default()
        },
    );

    let err = isp.query(0x0A02).await.unwrap_err();
    assert!(matches!(err, IspError::BusBusyTimeout { attempts: 20 }));
    assert_eq!(sim.line_samples(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_briefly_busy_peer() {
    let (isp, sim) = connected_with(
        LinkConfig::default(),
        SimBehavior {
            busy: BusyMode::Samples(25),
            ..Default::default()
        },
    );

    let start = Instant::now();
    isp.set_u8(0x1003, 0x05).await.unwrap();

    // 25 busy samples, then the free one that lets the send go out
    assert_eq!(sim.line_samples(), 26);
    // 10 x 1 ms + 15 x 5 ms
    assert!(start.elapsed() >= Duration::from_millis(85));
    assert_eq!(sim.param(0x1003).unwrap().as_ref(), &[0x05]);
}

#[tokio::test(start_paused = true)]
async fn test_unread_frame_is_drained() {
    init_tracing();
    let (isp, sim) = connected();

    // an acknowledgement the host never collected keeps the line busy
    let stale = frame::encode_response(PacketId::SetRes, 0x0999, 0x00, &[]).unwrap();
    sim.inject_unread_frame(&stale);
    assert!(isp.session().peer_event().is_pending());
    assert_eq!(sim.unread_bytes(), stale.total_length());

    isp.set_u8(0x1003, 0x07).await.unwrap();

    assert_eq!(sim.unread_bytes(), 0);
    assert!(!isp.session().peer_event().is_pending());
    assert_eq!(sim.param(0x1003).unwrap().as_ref(), &[0x07]);
    // drained after 50 failed attempts, well before the 1000 cap
    assert!(sim.line_samples() < 100, "took {} samples", sim.line_samples());
}

#[tokio::test(start_paused = true)]
async fn test_no_drain_without_peer_event() {
    let retry = RetryPolicy {
        max_attempts: 80,
        ..Default::default()
    };
    let (isp, sim) = connected_with(LinkConfig::default().with_retry(retry), SimBehavior::default());

    let stale = frame::encode_response(PacketId::SetRes, 0x0999, 0x00, &[]).unwrap();
    sim.inject_unread_frame(&stale);
    isp.session().peer_event().clear();

    let err = isp.set_u8(0x1003, 0x07).await.unwrap_err();
    assert!(matches!(err, IspError::BusBusyTimeout { attempts: 80 }));
    assert_eq!(sim.unread_bytes(), stale.total_length());
}

#[tokio::test(start_paused = true)]
async fn test_pending_notification_blocks_host() {
    let retry = RetryPolicy {
        max_attempts: 30,
        ..Default::default()
    };
    let (isp, sim) = connected_with(LinkConfig::default().with_retry(retry), SimBehavior::default());
    sim.raise_notification(0x0042);

    // the peer owns the notify line until the host polls it
    let err = isp.set_u8(0x1003, 0x01).await.unwrap_err();
    assert!(matches!(err, IspError::BusBusyTimeout { .. }));

    assert_eq!(
        isp.poll_notification(Duration::from_millis(10)).await.unwrap(),
        Some(NotificationId(0x0042))
    );
    isp.set_u8(0x1003, 0x01).await.unwrap();
}
