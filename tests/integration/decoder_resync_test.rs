//! Stream-level framing recovery: every intact frame survives the noise
//! around it, however the bytes are chunked.

use imu_daq::protocol::{encode_acceleration, Acceleration, DecodedPacket, FrameDecoder, FRAME_LEN};

/// Deterministic line noise that never contains the header byte.
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            match (state >> 16) as u8 {
                0x55 => 0x00,
                b => b,
            }
        })
        .collect()
}

fn frame(i: usize) -> [u8; FRAME_LEN] {
    encode_acceleration(&Acceleration::from_g(0.01 * i as f64, 0.0, 1.0, 25.0))
}

/// Decoded x accelerations, in g, rounded to the fixed-point step.
fn decoded_x(decoder: &mut FrameDecoder) -> Vec<f64> {
    decoder
        .drain()
        .into_iter()
        .filter_map(|packet| match packet {
            DecodedPacket::Acceleration(acc) => Some(acc.g()[0]),
            _ => None,
        })
        .collect()
}

fn expected_x(count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| Acceleration::from_g(0.01 * i as f64, 0.0, 1.0, 25.0).g()[0])
        .collect()
}

#[test]
fn test_frames_separated_by_noise_all_recovered() {
    let mut stream = noise(7, 1);
    for i in 0..40 {
        stream.extend_from_slice(&frame(i));
        stream.extend(noise(i % 13, i as u32 + 2));
    }

    let mut decoder = FrameDecoder::new();
    decoder.push(&stream);
    assert_eq!(decoded_x(&mut decoder), expected_x(40));
    assert_eq!(decoder.stats().frames_decoded, 40);
    assert!(decoder.stats().bytes_discarded > 0);
}

#[test]
fn test_corrupted_frame_is_dropped_and_neighbours_kept() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&frame(0));
    let mut corrupted = frame(1);
    corrupted[FRAME_LEN - 1] = corrupted[FRAME_LEN - 1].wrapping_add(1);
    if corrupted[FRAME_LEN - 1] == 0x55 {
        corrupted[FRAME_LEN - 1] = corrupted[FRAME_LEN - 1].wrapping_add(1);
    }
    stream.extend_from_slice(&corrupted);
    stream.extend_from_slice(&frame(2));

    let mut decoder = FrameDecoder::new();
    decoder.push(&stream);
    let xs = decoded_x(&mut decoder);
    let all = expected_x(3);
    assert_eq!(xs, vec![all[0], all[2]]);
    assert!(decoder.stats().frames_rejected >= 1);
}

#[test]
fn test_byte_at_a_time_delivery_matches_bulk() {
    let mut stream = noise(5, 99);
    for i in 0..25 {
        stream.extend_from_slice(&frame(i));
        stream.extend(noise(3, i as u32));
    }

    let mut bulk = FrameDecoder::new();
    bulk.push(&stream);
    let bulk_xs = decoded_x(&mut bulk);

    let mut trickle = FrameDecoder::new();
    let mut trickle_xs = Vec::new();
    for byte in &stream {
        trickle.push(std::slice::from_ref(byte));
        trickle_xs.extend(decoded_x(&mut trickle));
    }

    assert_eq!(bulk_xs, expected_x(25));
    assert_eq!(trickle_xs, bulk_xs);
}

#[test]
fn test_truncated_tail_waits_for_remaining_bytes() {
    let whole = frame(3);
    let mut decoder = FrameDecoder::new();
    decoder.push(&whole[..6]);
    assert!(decoder.decode_next().is_none());
    assert_eq!(decoder.buffered(), 6);
    decoder.push(&whole[6..]);
    assert!(matches!(
        decoder.decode_next(),
        Some(DecodedPacket::Acceleration(_))
    ));
    assert_eq!(decoder.buffered(), 0);
}
