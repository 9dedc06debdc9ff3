//! Batch mode: parameter sets coalesced into one frame

mod common;

use common::*;

#[tokio::test(start_paused = true)]
async fn test_batch_sends_one_frame() {
    let (isp, sim) = connected();

    isp.enter_batch_mode().await.unwrap();
    assert!(isp.session().batch_mode());
    isp.set_u8(0x1001, 0x01).await.unwrap();
    isp.set_u16(0x1002, 0x0203).await.unwrap();
    isp.set_u32(0x1003, 0x0405_0607).await.unwrap();

    // nothing reaches the bus while buffering
    assert!(sim.frames_received().is_empty());
    assert!(sim.out_transfers().is_empty());

    isp.leave_batch_mode().await.unwrap();
    assert!(!isp.session().batch_mode());
    assert_eq!(sim.frames_received(), vec![PacketId::WriteMulti]);

    assert_eq!(sim.param(0x1001).unwrap().as_ref(), &[0x01]);
    assert_eq!(sim.param(0x1002).unwrap().as_ref(), &[0x03, 0x02]);
    assert_eq!(sim.param(0x1003).unwrap().as_ref(), &[0x07, 0x06, 0x05, 0x04]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_frame_layout() {
    let (isp, sim) = connected();

    isp.enter_batch_mode().await.unwrap();
    isp.set_u8(0x1001, 0xAA).await.unwrap();
    isp.set_u8(0x1002, 0xBB).await.unwrap();
    isp.leave_batch_mode().await.unwrap();

    // 6 bytes framing + 2 records of 4 bytes, in a single write
    assert_eq!(sim.out_transfers(), vec![14]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_sends_nothing() {
    let (isp, sim) = connected();
    isp.enter_batch_mode().await.unwrap();
    isp.leave_batch_mode().await.unwrap();
    assert!(sim.frames_received().is_empty());

    // leaving twice is harmless
    isp.leave_batch_mode().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_batch_failure_reports_once() {
    let (isp, sim) = connected();

    isp.enter_batch_mode().await.unwrap();
    isp.set_u8(0x1001, 0x01).await.unwrap();
    isp.set_u8(0x1002, 0x02).await.unwrap();

    sim.set_behavior(SimBehavior {
        fail_status: Some(0x11),
        ..Default::default()
    });
    let err = isp.leave_batch_mode().await.unwrap_err();
    assert!(matches!(
        err,
        IspError::PeerReportedError {
            packet_id: PacketId::WriteMulti,
            code: 0x11
        }
    ));
    // batch mode is off and the buffer is gone either way
    assert!(!isp.session().batch_mode());
    sim.set_behavior(SimBehavior::default());
    isp.set_u8(0x1003, 0x03).await.unwrap();
    assert_eq!(sim.frames_received(), vec![PacketId::WriteMulti, PacketId::Set]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_uses_medium_timeout() {
    let (isp, sim) = connected();
    isp.enter_batch_mode().await.unwrap();
    isp.set_u8(0x1001, 0x01).await.unwrap();

    sim.set_behavior(SimBehavior {
        silent: true,
        ..Default::default()
    });
    let start = Instant::now();
    let err = isp.leave_batch_mode().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() >= Duration::from_secs(2));
}
