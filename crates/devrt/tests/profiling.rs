mod common;

use common::{f32_bytes, f32s, host, identity_program};
use devrt::{BuildOptions, ProfilingSession};

#[test]
fn session_exports_client_and_run_spans() -> anyhow::Result<()> {
    let client = host(1);
    let dir = tempfile::tempdir()?;
    let session = ProfilingSession::start();

    let shape = f32s(2);
    let compiled = client.compile(
        &identity_program(shape.clone()),
        &[shape.clone()],
        &BuildOptions::default(),
        false,
    )?;
    let input = client.buffer_from_host_bytes(&f32_bytes(&[1.0, 2.0]), &shape, 0)?;
    compiled.run(&[&input], 0)?;

    let export_dir = dir.path().join("traces");
    let path = session.stop(&export_dir)?;
    assert!(path.starts_with(&export_dir));

    let trace: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    let events = trace["traceEvents"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("traceEvents missing"))?;
    let names: Vec<&str> = events
        .iter()
        .filter_map(|event| event["name"].as_str())
        .collect();
    assert!(names.contains(&"client.compile"), "{names:?}");
    assert!(
        names.contains(&"client.buffer_from_host_bytes"),
        "{names:?}"
    );
    assert!(names.contains(&"executable.run"), "{names:?}");
    assert!(events.iter().all(|event| event["ph"] == "X"));
    Ok(())
}

#[test]
fn dropped_session_writes_nothing() -> anyhow::Result<()> {
    let client = host(1);
    let dir = tempfile::tempdir()?;
    {
        let _session = ProfilingSession::start();
        client.buffer_from_host_bytes(&f32_bytes(&[1.0]), &f32s(1), 0)?;
    }
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
