//! Configuration file loading, end to end.

use std::io::Write;

use shoal::{ErrorKind, RuntimeBuilder, RuntimeConfig};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

#[test]
fn config_file_round_trips_through_the_builder() {
    let file = write_config(
        "# test deployment\n\
         cores_max 2\n\
         cores_guaranteed 1\n\
         preempt_tick_us 250\n\
         host_addr 10.0.0.3:4242\n",
    );
    let cfg = RuntimeConfig::from_file(file.path()).expect("config must parse");
    assert_eq!(cfg.cores_max, 2);
    assert_eq!(cfg.cores_guaranteed, 1);
    assert_eq!(cfg.preempt_tick_us, 250);
    assert_eq!(cfg.host_addr.as_deref(), Some("10.0.0.3:4242"));

    let runtime = RuntimeBuilder::new(cfg).start().expect("runtime must start");
    assert_eq!(runtime.grant().maximum, 2);
    runtime.shutdown();
}

#[test]
fn missing_file_is_a_config_error() {
    let err = RuntimeConfig::from_file("/nonexistent/shoal.config").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}

#[test]
fn builder_from_file_rejects_bad_directives() {
    let file = write_config("cores_max 2\nmystery_knob 7\n");
    let err = RuntimeBuilder::from_file(file.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}

#[test]
fn config_serializes_for_diagnostics() {
    let cfg = RuntimeConfig::default();
    let json = serde_json::to_value(&cfg).expect("config serializes");
    assert_eq!(json["cores_guaranteed"], 1);
    assert_eq!(json["preempt_tick_us"], 100);
}
