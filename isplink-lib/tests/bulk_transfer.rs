//! Chunked firmware upload

mod common;

use common::*;

const IMAGE_LEN: usize = 185_000;

/// Bus writes larger than any command frame, i.e. firmware chunks.
fn chunk_writes(sim: &SimulatedIsp) -> Vec<usize> {
    sim.out_transfers().into_iter().filter(|len| *len > 64).collect()
}

#[tokio::test(start_paused = true)]
async fn test_enveloped_transfer() {
    init_tracing();
    let (isp, sim) = connected();
    let image = test_image(IMAGE_LEN);
    let mut source = MemorySource::new(image.clone());

    let report = isp.transfer_firmware(&mut source, ChunkFraming::Enveloped).await.unwrap();

    assert_eq!(
        report,
        TransferReport {
            total_bytes: IMAGE_LEN,
            chunks: 4,
            framing: ChunkFraming::Enveloped,
        }
    );
    assert_eq!(chunk_writes(&sim), vec![61_446, 61_446, 61_446, 686]);

    let frames = sim.frames_received();
    assert_eq!(frames.iter().filter(|id| **id == PacketId::FwupStart).count(), 1);
    assert_eq!(frames.iter().filter(|id| **id == PacketId::FwupData).count(), 4);
    assert_eq!(frames.iter().filter(|id| **id == PacketId::DataComplete).count(), 1);
    assert_eq!(frames.first(), Some(&PacketId::FwupStart));
    assert_eq!(frames.last(), Some(&PacketId::DataComplete));

    assert_eq!(sim.received_image().unwrap(), image);
    assert_eq!(sim.unread_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_payload_only_transfer() {
    let (isp, sim) = connected();
    let image = test_image(IMAGE_LEN);
    let mut source = MemorySource::new(image.clone());

    let report = isp.transfer_firmware(&mut source, ChunkFraming::PayloadOnly).await.unwrap();

    assert_eq!(report.chunks, 4);
    assert_eq!(chunk_writes(&sim), vec![61_440, 61_440, 61_440, 680]);
    // only the two handshakes are frames
    assert_eq!(sim.frames_received(), vec![PacketId::FwupStart, PacketId::DataComplete]);
    assert_eq!(sim.received_image().unwrap(), image);
}

#[tokio::test(start_paused = true)]
async fn test_exact_multiple_of_chunk() {
    let (isp, sim) = connected_with(LinkConfig::default().with_firmware_chunk(1000), SimBehavior::default());
    let image = test_image(3000);
    let mut source = MemorySource::new(image.clone());

    let report = isp.transfer_firmware(&mut source, ChunkFraming::PayloadOnly).await.unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(chunk_writes(&sim), vec![1000, 1000, 1000]);
    assert_eq!(sim.received_image().unwrap(), image);
}

#[tokio::test(start_paused = true)]
async fn test_transfer_from_file() {
    let image = test_image(10_000);
    let path = std::env::temp_dir().join(format!("isplink-fw-{}.bin", std::process::id()));
    std::fs::write(&path, &image).unwrap();

    let (isp, sim) = connected_with(LinkConfig::default().with_firmware_chunk(4096), SimBehavior::default());
    let mut source = FileSource::open(&path).await.unwrap();
    let report = isp.transfer_firmware(&mut source, ChunkFraming::Enveloped).await.unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(report.total_bytes, 10_000);
    assert_eq!(report.chunks, 3);
    assert_eq!(sim.received_image().unwrap(), image);
}

#[tokio::test(start_paused = true)]
async fn test_empty_image_rejected() {
    let (isp, sim) = connected();
    let mut source = MemorySource::new(Vec::new());

    let err = isp.transfer_firmware(&mut source, ChunkFraming::Enveloped).await.unwrap_err();
    assert!(matches!(err, IspError::Frame(FrameError::InvalidPayloadSize(0))));
    assert!(sim.frames_received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_oversize_chunk_rejected() {
    let (isp, sim) = connected_with(LinkConfig::default().with_firmware_chunk(70_000), SimBehavior::default());
    let mut source = MemorySource::new(test_image(100));

    let err = isp.transfer_firmware(&mut source, ChunkFraming::Enveloped).await.unwrap_err();
    assert!(matches!(err, IspError::InvalidChunkSize(70_000)));
    assert!(sim.frames_received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_announce() {
    let (isp, sim) = connected();
    let mut source = MemorySource::new(test_image(5000));

    sim.set_behavior(SimBehavior {
        fail_status: Some(0x30),
        ..Default::default()
    });
    let err = isp.transfer_firmware(&mut source, ChunkFraming::Enveloped).await.unwrap_err();
    assert!(matches!(
        err,
        IspError::PeerReportedError {
            packet_id: PacketId::FwupStart,
            code: 0x30
        }
    ));
    assert_eq!(sim.frames_received(), vec![PacketId::FwupStart]);
    assert!(sim.received_image().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_update_complete_times_out() {
    let (isp, sim) = connected_with(
        LinkConfig::default().with_firmware_chunk(1024),
        SimBehavior {
            withhold_update_complete: true,
            ..Default::default()
        },
    );
    let mut source = MemorySource::new(test_image(2048));

    let start = Instant::now();
    let err = isp.transfer_firmware(&mut source, ChunkFraming::PayloadOnly).await.unwrap_err();

    assert!(
        matches!(err, IspError::Timeout { packet_id: PacketId::UpdateComplete, .. }),
        "unexpected error: {err:?}"
    );
    assert!(start.elapsed() >= Duration::from_secs(240));
    assert!(start.elapsed() < Duration::from_secs(241));
    assert_eq!(sim.frames_received(), vec![PacketId::FwupStart, PacketId::DataComplete]);
}
