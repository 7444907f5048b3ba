use devrt::registry;
use devrt::{
    gpu_client, plugin_client, AllocatorKind, BuildOptions, DType, DeviceKind, ErrorKind, Program,
    ProgramBuilder, Shape,
};
use devrt_backend_cuda::{is_available, CUDA_PLATFORM_NAME};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn platform_is_registered_under_both_names() {
    init_logging();
    assert!(registry::has_platform("gpu"));
    assert!(registry::has_platform(CUDA_PLATFORM_NAME));
}

#[test]
fn missing_driver_is_not_found() {
    init_logging();
    if is_available() {
        return;
    }
    let err = gpu_client(0.5, false, AllocatorKind::Default).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("CUDA driver unavailable"), "{err}");

    let err = plugin_client(CUDA_PLATFORM_NAME).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn invalid_fraction_is_rejected_even_without_a_driver() {
    let err = gpu_client(2.0, false, AllocatorKind::BestFit).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn identity_round_trip_on_gpu() -> anyhow::Result<()> {
    init_logging();
    if !is_available() {
        return Ok(());
    }
    let client = gpu_client(0.1, false, AllocatorKind::BestFit)?;
    assert_eq!(client.kind(), DeviceKind::Gpu);

    let shape = Shape::new(DType::F32, [4]);
    let mut builder = ProgramBuilder::new();
    let x = builder.add_parameter(shape.clone());
    let program = Program::from_entry(builder.finish("identity", vec![x])?);
    let compiled = client.compile(&program, &[shape.clone()], &BuildOptions::default(), false)?;

    let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let input = client.buffer_from_host_bytes(&bytes, &shape, 0)?;
    assert_ne!(input.device_pointer()?, 0);
    let outputs = compiled.run(&[&input], 0)?;
    assert_eq!(outputs[0].to_host_bytes(16)?, bytes);

    let stats = client.memory_stats(0)?;
    assert!(stats.bytes_in_use >= 32);
    drop(outputs);
    drop(input);
    assert_eq!(client.memory_stats(0)?.bytes_in_use, 0);
    Ok(())
}
