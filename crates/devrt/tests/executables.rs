mod common;

use common::{binary_program, f32_bytes, f32_values, f32s, host, identity_program};
use devrt::program::BinaryOp;
use devrt::{BuildOptions, DType, ErrorKind, Literal, Shape};

#[test]
fn identity_returns_its_argument() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(4);
    let program = identity_program(shape.clone());
    let compiled = client.compile(&program, &[shape.clone()], &BuildOptions::default(), false)?;
    assert_eq!(compiled.device_assignment(), &[0]);
    assert_eq!(compiled.parameter_shapes(), &[shape.clone()]);
    assert_eq!(compiled.result_shapes(), &[shape.clone()]);

    let input = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0, 3.0, 4.0]), &shape, 0)?;
    let outputs = compiled.run(&[&input], 0)?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].device(), 0);
    assert_eq!(outputs[0].shape()?, &shape);
    assert_eq!(
        f32_values(&outputs[0].to_host_bytes(16)?),
        vec![1.0, 2.0, 3.0, 4.0]
    );
    Ok(())
}

#[test]
fn add_combines_two_arguments() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(3);
    let program = binary_program(BinaryOp::Add, shape.clone());
    let compiled = client.compile(
        &program,
        &[shape.clone(), shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let lhs = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0, 3.0]), &shape, 0)?;
    let rhs = client.buffer_from_host_bytes(&f32_bytes(&[0.5, 0.5, -3.0]), &shape, 0)?;
    let outputs = compiled.run(&[&lhs, &rhs], 0)?;
    assert_eq!(
        f32_values(&outputs[0].to_host_bytes(12)?),
        vec![1.5, 2.5, 0.0]
    );

    // Arguments are borrowed, not consumed.
    assert_eq!(f32_values(&lhs.to_host_bytes(12)?), vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn wrong_argument_count_is_rejected_before_execution() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(2);
    let program = binary_program(BinaryOp::Mul, shape.clone());
    let compiled = client.compile(
        &program,
        &[shape.clone(), shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let only = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0]), &shape, 0)?;
    let before = client.memory_stats(0)?;

    let err = compiled.run(&[&only], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(client.memory_stats(0)?, before);
    Ok(())
}

#[test]
fn argument_shape_must_match_parameter() -> anyhow::Result<()> {
    let client = host(1);
    let program = identity_program(f32s(4));
    let compiled = client.compile(&program, &[f32s(4)], &BuildOptions::default(), false)?;
    let wrong = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0]), &f32s(2), 0)?;
    let err = compiled.run(&[&wrong], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("f32[4]"), "{err}");
    Ok(())
}

#[test]
fn arguments_from_another_client_are_rejected() -> anyhow::Result<()> {
    let first = host(1);
    let second = host(1);
    let shape = f32s(1);
    let compiled = first.compile(
        &identity_program(shape.clone()),
        &[shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let foreign = second.buffer_from_host_bytes(&f32_bytes(&[1.0]), &shape, 0)?;
    let err = compiled.run(&[&foreign], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[test]
fn deallocated_argument_is_use_after_free() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(1);
    let compiled = client.compile(
        &identity_program(shape.clone()),
        &[shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let mut input = client.buffer_from_host_bytes(&f32_bytes(&[1.0]), &shape, 0)?;
    input.deallocate()?;
    let err = compiled.run(&[&input], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UseAfterFree);
    Ok(())
}

#[test]
fn non_portable_program_stays_on_its_assignment() -> anyhow::Result<()> {
    let client = host(2);
    let shape = f32s(1);
    let program = identity_program(shape.clone());

    let pinned = client.compile(&program, &[shape.clone()], &BuildOptions::default(), false)?;
    let on_one = client.buffer_from_host_bytes(&f32_bytes(&[7.0]), &shape, 1)?;
    let err = pinned.run(&[&on_one], 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceMismatch);

    let on_zero = client.buffer_from_host_bytes(&f32_bytes(&[7.0]), &shape, 0)?;
    assert_eq!(pinned.run(&[&on_zero], 0)?.len(), 1);
    let err = pinned.run(&[&on_one], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceMismatch);

    let ordinal = client.compile(
        &program,
        &[shape.clone()],
        &BuildOptions::default().with_device_ordinal(1),
        false,
    )?;
    assert_eq!(ordinal.device_assignment(), &[1]);
    let outputs = ordinal.run(&[&on_one], 1)?;
    assert_eq!(outputs[0].device(), 1);
    Ok(())
}

#[test]
fn portable_program_runs_on_any_device() -> anyhow::Result<()> {
    let client = host(2);
    let shape = f32s(2);
    let compiled = client.compile(
        &identity_program(shape.clone()),
        &[shape.clone()],
        &BuildOptions::default(),
        true,
    )?;
    assert!(compiled.is_portable());
    assert!(compiled.device_assignment().is_empty());

    for device in 0..2 {
        let input = client.buffer_from_host_bytes(&f32_bytes(&[3.0, 4.0]), &shape, device)?;
        let outputs = compiled.run(&[&input], device)?;
        assert_eq!(outputs[0].device(), device);
        assert_eq!(f32_values(&outputs[0].to_host_bytes(8)?), vec![3.0, 4.0]);
    }

    let input = client.buffer_from_host_bytes(&f32_bytes(&[3.0, 4.0]), &shape, 0)?;
    let err = compiled.run(&[&input], 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    Ok(())
}

#[test]
fn integer_division_by_zero_fails_at_run_time() -> anyhow::Result<()> {
    let client = host(1);
    let shape = Shape::new(DType::S32, [2]);
    let program = binary_program(BinaryOp::Div, shape.clone());
    let compiled = client.compile(
        &program,
        &[shape.clone(), shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let lhs = client.buffer_from_literal(&Literal::from_s32([2], &[6, 1]), 0)?;
    let rhs = client.buffer_from_literal(&Literal::from_s32([2], &[3, 0]), 0)?;
    let err = compiled.run(&[&lhs, &rhs], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
    assert!(err.to_string().contains("division by zero"), "{err}");
    Ok(())
}

#[test]
fn compile_rejects_bad_layouts_dtypes_and_assignments() {
    let client = host(1);
    let shape = f32s(2);
    let program = identity_program(shape.clone());

    let err = client
        .compile(&program, &[], &BuildOptions::default(), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompilationError);

    let err = client
        .compile(&program, &[f32s(3)], &BuildOptions::default(), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompilationError);

    let err = client
        .compile(
            &program,
            &[shape.clone()],
            &BuildOptions::default().with_replicas(2),
            false,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompilationError);

    let half = Shape::new(DType::F16, [2]);
    let err = client
        .compile(
            &identity_program(half.clone()),
            &[half],
            &BuildOptions::default(),
            false,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompilationError);
}

#[test]
fn serialized_executable_round_trips() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(2);
    let program = binary_program(BinaryOp::Sub, shape.clone());
    let compiled = client.compile(
        &program,
        &[shape.clone(), shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let blob = compiled.serialize_executable()?;
    let restored = client.deserialize_executable(&blob)?;

    assert!(compiled.fingerprint().is_some());
    assert_eq!(restored.fingerprint(), compiled.fingerprint());
    assert_eq!(restored.device_assignment(), compiled.device_assignment());
    assert_eq!(restored.parameter_shapes(), compiled.parameter_shapes());

    let lhs = client.buffer_from_host_bytes(&f32_bytes(&[5.0, 1.0]), &shape, 0)?;
    let rhs = client.buffer_from_host_bytes(&f32_bytes(&[2.0, 1.0]), &shape, 0)?;
    let restored_bytes = restored.run(&[&lhs, &rhs], 0)?[0].to_host_bytes(8)?;
    let original_bytes = compiled.run(&[&lhs, &rhs], 0)?[0].to_host_bytes(8)?;
    assert_eq!(restored_bytes, original_bytes);
    assert_eq!(f32_values(&restored_bytes), vec![3.0, 0.0]);
    Ok(())
}

#[test]
fn same_program_has_the_same_fingerprint() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(2);
    let program = identity_program(shape.clone());
    let first = client.compile(&program, &[shape.clone()], &BuildOptions::default(), false)?;
    let second = client.compile(&program, &[shape.clone()], &BuildOptions::default(), true)?;
    assert_eq!(first.fingerprint(), second.fingerprint());

    let other = client.compile(
        &identity_program(f32s(3)),
        &[f32s(3)],
        &BuildOptions::default(),
        false,
    )?;
    assert_ne!(first.fingerprint(), other.fingerprint());
    Ok(())
}

#[test]
fn corrupt_blobs_are_rejected() -> anyhow::Result<()> {
    let client = host(1);
    let shape = f32s(2);
    let compiled = client.compile(
        &identity_program(shape.clone()),
        &[shape],
        &BuildOptions::default(),
        false,
    )?;
    let blob = compiled.serialize_executable()?;

    let err = client
        .deserialize_executable(b"not an executable")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptData);

    let err = client
        .deserialize_executable(&blob[..blob.len() - 3])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptData);

    let err = client.deserialize_executable(&[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptData);
    Ok(())
}

#[test]
fn blob_for_more_devices_than_the_client_has_is_corrupt() -> anyhow::Result<()> {
    let wide = host(2);
    let narrow = host(1);
    let shape = f32s(1);
    let compiled = wide.compile(
        &identity_program(shape.clone()),
        &[shape],
        &BuildOptions::default().with_replicas(2),
        false,
    )?;
    let blob = compiled.serialize_executable()?;
    let err = narrow.deserialize_executable(&blob).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptData);
    assert!(wide.deserialize_executable(&blob).is_ok());
    Ok(())
}

#[test]
fn replicated_run_uses_one_device_per_replica() -> anyhow::Result<()> {
    let client = host(2);
    let shape = f32s(2);
    let compiled = client.compile(
        &binary_program(BinaryOp::Maximum, shape.clone()),
        &[shape.clone(), shape.clone()],
        &BuildOptions::default().with_replicas(2),
        false,
    )?;
    assert_eq!(compiled.device_assignment(), &[0, 1]);

    let a0 = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 5.0]), &shape, 0)?;
    let b0 = client.buffer_from_host_bytes(&f32_bytes(&[2.0, 4.0]), &shape, 0)?;
    let a1 = client.buffer_from_host_bytes(&f32_bytes(&[-1.0, 0.0]), &shape, 1)?;
    let b1 = client.buffer_from_host_bytes(&f32_bytes(&[-2.0, 9.0]), &shape, 1)?;

    let results = compiled.run_replicated(&[vec![&a0, &b0], vec![&a1, &b1]])?;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0][0].device(), 0);
    assert_eq!(results[1][0].device(), 1);
    assert_eq!(f32_values(&results[0][0].to_host_bytes(8)?), vec![2.0, 5.0]);
    assert_eq!(
        f32_values(&results[1][0].to_host_bytes(8)?),
        vec![-1.0, 9.0]
    );

    let err = compiled.run_replicated(&[vec![&a0, &b0]]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = compiled
        .run_replicated(&[vec![&a0, &b0], vec![&a0, &b0]])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceMismatch);
    Ok(())
}
