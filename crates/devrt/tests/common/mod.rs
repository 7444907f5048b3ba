#![allow(dead_code)]

use std::time::Duration;

use devrt::program::{BinaryOp, Operand, Operation};
use devrt::{
    host_client_with, DType, HostOptions, Program, ProgramBuilder, RuntimeClient, RuntimeConfig,
    Shape,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn f32s(n: usize) -> Shape {
    Shape::new(DType::F32, [n])
}

/// Host options independent of the environment, with short feed deadlines.
pub fn host_options(devices: usize) -> HostOptions {
    HostOptions::from_config(&RuntimeConfig::default())
        .with_device_count(devices)
        .with_outfeed_timeout(Duration::from_millis(100))
        .with_feed_timeout(Duration::from_millis(100))
}

pub fn host(devices: usize) -> RuntimeClient {
    init_logging();
    host_client_with(host_options(devices)).expect("host client")
}

pub fn identity_program(shape: Shape) -> Program {
    let mut builder = ProgramBuilder::new();
    let x = builder.add_parameter(shape);
    Program::from_entry(builder.finish("identity", vec![x]).expect("identity"))
}

pub fn binary_program(op: BinaryOp, shape: Shape) -> Program {
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(shape.clone());
    let rhs = builder.add_parameter(shape.clone());
    let out = builder.emit(
        Operation::Binary(op),
        vec![Operand::Value(lhs), Operand::Value(rhs)],
        shape,
    );
    Program::from_entry(builder.finish("main", vec![out]).expect("binary"))
}

/// Reads one value from infeed, adds it to the parameter, sends the sum to
/// outfeed and returns it.
pub fn accumulate_program(shape: Shape) -> Program {
    let mut builder = ProgramBuilder::new();
    let bias = builder.add_parameter(shape.clone());
    let fed = builder.emit(Operation::Infeed, Vec::new(), shape.clone());
    let sum = builder.emit(
        Operation::Binary(BinaryOp::Add),
        vec![Operand::Value(bias), Operand::Value(fed)],
        shape.clone(),
    );
    let sent = builder.emit(Operation::Outfeed, vec![Operand::Value(sum)], shape);
    let function = builder.finish("accumulate", vec![sent]).expect("finish");
    Program::from_entry(function)
}
