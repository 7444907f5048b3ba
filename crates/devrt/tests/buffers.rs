mod common;

use common::{f32_bytes, f32_values, f32s, host, host_options, init_logging};
use devrt::{host_client_with, DType, ErrorKind, Literal, Shape};

#[test]
fn host_bytes_round_trip() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(4);
    let buffer = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0, 3.0, 4.0]), &shape, 0)?;

    assert_eq!(buffer.device(), 0);
    assert_eq!(buffer.shape()?, &shape);
    assert_eq!(buffer.on_device_size_in_bytes()?, 16);
    let bytes = buffer.to_host_bytes(16)?;
    assert_eq!(f32_values(&bytes), vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn literal_round_trip() -> anyhow::Result<()> {
    let client = host(1);
    let literal = Literal::from_s32([2, 2], &[1, -2, 3, -4]);
    let buffer = client.buffer_from_literal(&literal, 0)?;
    let back = buffer.to_literal()?;
    assert_eq!(back.shape, Shape::new(DType::S32, [2, 2]));
    assert_eq!(back.to_s32_vec(), Some(vec![1, -2, 3, -4]));
    Ok(())
}

#[test]
fn byte_count_must_match_shape() {
    let client = host(1);
    let err = client
        .buffer_from_host_bytes(&[0u8; 12], &f32s(4), 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.operation(), "buffer_from_host_bytes");
}

#[test]
fn device_out_of_range_is_a_device_error() {
    let client = host(1);
    let err = client
        .buffer_from_host_bytes(&f32_bytes(&[1.0]), &f32s(1), 3)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
}

#[test]
fn copies_between_devices_are_independent() -> anyhow::Result<()> {
    let client = host(2);
    assert_eq!(client.device_count(), 2);
    let original = client.buffer_from_host_bytes(&f32_bytes(&[5.0, 6.0]), &f32s(2), 0)?;

    let moved = original.copy_to_device(1)?;
    assert_eq!(moved.device(), 1);
    assert_ne!(moved.id(), original.id());
    assert_eq!(f32_values(&moved.to_host_bytes(8)?), vec![5.0, 6.0]);

    let same = original.copy_to_device(0)?;
    assert_eq!(same.device(), 0);
    assert_ne!(same.device_pointer()?, original.device_pointer()?);

    drop(moved);
    drop(same);
    assert_eq!(original.device(), 0);
    assert_eq!(f32_values(&original.to_host_bytes(8)?), vec![5.0, 6.0]);

    let err = original.copy_to_device(2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    Ok(())
}

#[test]
fn deallocated_buffer_rejects_every_operation() -> anyhow::Result<()> {
    let client = host(2);
    let mut buffer = client.buffer_from_host_bytes(&f32_bytes(&[1.0]), &f32s(1), 0)?;
    let id = buffer.id();
    buffer.deallocate()?;
    assert!(buffer.is_deleted());
    assert_eq!(buffer.id(), id);
    assert_eq!(buffer.device(), 0);
    assert_eq!(buffer.client().id(), client.id());

    assert_eq!(buffer.shape().unwrap_err().kind(), ErrorKind::UseAfterFree);
    assert_eq!(
        buffer.on_device_size_in_bytes().unwrap_err().kind(),
        ErrorKind::UseAfterFree
    );
    assert_eq!(
        buffer.to_host_bytes(4).unwrap_err().kind(),
        ErrorKind::UseAfterFree
    );
    assert_eq!(
        buffer.to_literal().unwrap_err().kind(),
        ErrorKind::UseAfterFree
    );
    assert_eq!(
        buffer.copy_to_device(1).unwrap_err().kind(),
        ErrorKind::UseAfterFree
    );
    assert_eq!(
        buffer.device_pointer().unwrap_err().kind(),
        ErrorKind::UseAfterFree
    );
    assert_eq!(
        buffer.deallocate().unwrap_err().kind(),
        ErrorKind::UseAfterFree
    );
    Ok(())
}

#[test]
fn memory_limit_is_enforced_and_released() -> anyhow::Result<()> {
    init_logging();
    let client = host_client_with(host_options(1).with_memory_limit(32))?;

    let first = client.buffer_from_host_bytes(&[0u8; 24], &Shape::new(DType::U8, [24]), 0)?;
    let err = client
        .buffer_from_host_bytes(&[0u8; 16], &Shape::new(DType::U8, [16]), 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert!(err.to_string().contains("out of memory"), "{err}");

    let stats = client.memory_stats(0)?;
    assert_eq!(stats.bytes_in_use, 24);
    assert_eq!(stats.bytes_limit, Some(32));

    drop(first);
    assert_eq!(client.memory_stats(0)?.bytes_in_use, 0);
    let _second = client.buffer_from_host_bytes(&[0u8; 16], &Shape::new(DType::U8, [16]), 0)?;
    assert_eq!(client.memory_stats(0)?.peak_bytes_in_use, 24);
    Ok(())
}

#[test]
fn explicit_deallocate_releases_memory() -> anyhow::Result<()> {
    let client = host(1);
    let mut buffer = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0]), &f32s(2), 0)?;
    assert_eq!(client.memory_stats(0)?.bytes_in_use, 8);
    buffer.deallocate()?;
    assert_eq!(client.memory_stats(0)?.bytes_in_use, 0);
    Ok(())
}

#[test]
fn device_pointer_is_stable() -> anyhow::Result<()> {
    let client = host(1);
    let buffer = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0]), &f32s(2), 0)?;
    let pointer = buffer.device_pointer()?;
    assert_ne!(pointer, 0);
    assert_eq!(buffer.device_pointer()?, pointer);
    Ok(())
}

#[test]
fn reading_back_with_the_wrong_size_fails() -> anyhow::Result<()> {
    let client = host(1);
    let buffer = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0]), &f32s(2), 0)?;
    let err = buffer.to_host_bytes(4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(buffer.to_host_bytes(8)?.len(), 8);
    Ok(())
}

#[test]
fn buffers_keep_the_client_alive() -> anyhow::Result<()> {
    let client = host(1);
    let buffer = client.buffer_from_host_bytes(&f32_bytes(&[9.0]), &f32s(1), 0)?;
    let id = client.id();
    drop(client);
    assert_eq!(buffer.client().id(), id);
    assert_eq!(f32_values(&buffer.to_host_bytes(4)?), vec![9.0]);
    Ok(())
}
