//! Performance benchmarks for the hot paths of a tick

use shared::avatar::{check_collision, resolve_collision, Avatar, MoveRequest, AVATAR_SPEED};
use shared::{
    encode_frame, handoff_queue, read_frame, ClientId, Message, ObjectId, Owner, Replica,
    MAX_CLIENT_REQUESTS,
};
use std::time::Instant;

/// Benchmarks message encoding plus framing
#[test]
fn benchmark_message_encoding() {
    let mut body = Vec::new();
    Avatar::new(100.0, 200.0).write_update(&mut body);
    let message = Message::UpdateObject {
        object: ObjectId(7),
        owner: Owner::Client(ClientId(3)),
        body,
    };

    let iterations = 100_000;
    let start = Instant::now();

    let mut bytes = 0;
    for _ in 0..iterations {
        let frame = encode_frame(&message.encode()).unwrap();
        bytes += frame.len();
    }

    let duration = start.elapsed();
    println!(
        "Message encoding: {} iterations in {:?} ({:.2} ns/iter, {} bytes)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64,
        bytes
    );

    assert!(duration.as_secs() < 2);
}

/// Benchmarks decoding a stream of back-to-back frames
#[tokio::test]
async fn benchmark_frame_decoding() {
    let request = MoveRequest {
        sequence: 1,
        left: false,
        right: true,
        jump: false,
    };
    let message = Message::ClientRequest {
        object: ObjectId(0),
        request: shared::avatar::MOVE_REQUEST,
        body: request.encode().unwrap(),
    };
    let frame = encode_frame(&message.encode()).unwrap();

    let iterations = 20_000;
    let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * iterations).collect();
    let mut reader = stream.as_slice();

    let start = Instant::now();
    for _ in 0..iterations {
        let payload = read_frame(&mut reader, None).await.unwrap();
        assert_eq!(Message::decode(&payload).unwrap(), message);
    }

    let duration = start.elapsed();
    println!(
        "Frame decoding: {} frames in {:?} ({:.2} μs/frame)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(reader.is_empty());
    assert!(duration.as_secs() < 2);
}

/// Benchmarks the bounded per-tick drain of a flooded queue
#[test]
fn benchmark_queue_drain() {
    let (sender, mut queue) = handoff_queue();
    let messages = 100_000;
    for i in 0..messages {
        sender.push(i);
    }

    let start = Instant::now();
    let mut ticks = 0;
    let mut drained = 0;
    while !queue.is_empty() {
        drained += queue.drain(MAX_CLIENT_REQUESTS, |_| {});
        ticks += 1;
    }

    let duration = start.elapsed();
    println!(
        "Queue drain: {} messages over {} ticks in {:?}",
        drained, ticks, duration
    );

    assert_eq!(drained, messages);
    assert_eq!(ticks, messages.div_ceil(MAX_CLIENT_REQUESTS));
    assert!(duration.as_secs() < 2);
}

/// Benchmarks collision detection performance
#[test]
fn benchmark_collision_detection() {
    let a = Avatar::new(100.0, 100.0);
    let b = Avatar::new(110.0, 110.0);

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = check_collision(&a, &b);
    }

    let duration = start.elapsed();
    println!(
        "Collision detection: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 500);
}

/// Benchmarks a full arena step: movement plus pairwise collision resolution
#[test]
fn benchmark_arena_step() {
    let mut avatars: Vec<Avatar> = (0..16)
        .map(|i| {
            let mut avatar = Avatar::new(i as f32 * 20.0, 100.0);
            avatar.state.vel_x = if i % 2 == 0 { AVATAR_SPEED } else { -AVATAR_SPEED };
            avatar.state.on_ground = false;
            avatar
        })
        .collect();

    let steps = 1_000;
    let start = Instant::now();

    for _ in 0..steps {
        for avatar in avatars.iter_mut() {
            avatar.step(1.0 / 60.0);
        }
        for i in 0..avatars.len() {
            let (left, right) = avatars.split_at_mut(i + 1);
            for other in right.iter_mut() {
                resolve_collision(&mut left[i], other);
            }
        }
    }

    let duration = start.elapsed();
    println!(
        "Arena step: {} steps of {} avatars in {:?} ({:.2} μs/step)",
        steps,
        avatars.len(),
        duration,
        duration.as_micros() as f64 / steps as f64
    );

    assert!(duration.as_secs() < 2);
}
