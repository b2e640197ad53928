//! End-to-end runs: settings file on disk, scripted device, CSV and fault log
//! output on disk.

use modbus_master::config::HostConfig;
use modbus_master::fault_log::FileFaultLog;
use modbus_master::mock::{MockResponse, MockTransport};
use modbus_master::settings::MasterSettings;
use modbus_master::sink::CsvResultSink;
use modbus_master::{CycleOutcome, PollingCycle, Scheduler, SchedulerState};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

const SETTINGS: &str = "\
// plant meter
[Main]
Logging=Yes
Timeout=500
Port=IP
IP=127.0.0.1:1502
DeviceID=3
Period=0

[Reading]
1=100;4;uint16;sint16;uint32
2=200;9;string8_18
3=300;2;utc_timestamp
";

fn ascii(text: &str, registers: usize) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(registers * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn device() -> MockTransport {
    MockTransport::new()
        .with_registers(100, vec![230, 0xFFF6, 0x0001, 0x86A0])
        .with_registers(200, ascii("METER-7", 9))
        .with_registers(300, vec![0x6553, 0xF100])
}

fn write_settings(dir: &Path) -> MasterSettings {
    let path = dir.join("settings.ini");
    std::fs::write(&path, SETTINGS).unwrap();
    MasterSettings::load(&path).unwrap()
}

fn csv_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .map(|path| std::fs::read_to_string(path).unwrap())
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_single_run_writes_csv() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path());
    assert_eq!(settings.poll_period(), None);

    let transport = device();
    let cycle = PollingCycle::new(
        Arc::new(transport.clone()),
        Arc::new(CsvResultSink::new(dir.path(), settings.value_addresses())),
        Arc::new(FileFaultLog::new(dir.path().join("faults.log"), false)),
    );
    let scheduler = Scheduler::new(cycle);
    let (_tx, rx) = watch::channel(false);

    let summary = scheduler.run(&settings, rx).await.unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.failed_groups, 0);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(transport.closed(), 1);

    let files = csv_files(dir.path());
    assert_eq!(files.len(), 1);

    let lines: Vec<&str> = files[0].split("\r\n").collect();
    assert_eq!(lines[0], "Timestamp;100;101;102;200;300");

    let row: Vec<&str> = lines[1].split(';').collect();
    assert_eq!(row.len(), 6);
    assert_eq!(row[0].len(), "HH:MM:SS".len());
    assert_eq!(
        &row[1..],
        &["230", "-10", "100000", "METER-7", "2023.11.14 22:13:20"]
    );

    assert!(!dir.path().join("faults.log").exists());
}

#[tokio::test]
async fn test_failed_group_logged_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path());
    let fault_log = dir.path().join("faults.log");
    let sink = Arc::new(CsvResultSink::new(dir.path(), settings.value_addresses()));
    let (_tx, mut rx) = watch::channel(false);

    let busy = device().with_response(200, MockResponse::Exception("SlaveDeviceBusy".into()));
    let cycle = PollingCycle::new(
        Arc::new(busy),
        sink.clone(),
        Arc::new(FileFaultLog::new(&fault_log, false)),
    );

    let outcome = cycle.run(&settings, &mut rx).await.unwrap();

    let CycleOutcome::Saved(report) = outcome else {
        panic!("Expected saved cycle");
    };
    assert_eq!(report.failed_groups, vec![2]);

    let faults = std::fs::read_to_string(&fault_log).unwrap();
    assert!(faults.contains("Group 2"));
    assert!(faults.contains("SlaveDeviceBusy"));
    assert!(faults.ends_with("\r\n\r\n\r\n"));

    // The device recovers; the next row fills the column left empty.
    let healthy = PollingCycle::new(
        Arc::new(device()),
        sink,
        Arc::new(FileFaultLog::new(&fault_log, false)),
    );
    healthy.run(&settings, &mut rx).await.unwrap();

    let files = csv_files(dir.path());
    let lines: Vec<Vec<&str>> = files[0]
        .lines()
        .map(|line| line.split(';').collect())
        .collect();

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], vec!["Timestamp", "100", "101", "102", "200", "300"]);
    assert_eq!(&lines[1][1..], &["230", "-10", "100000", "", "2023.11.14 22:13:20"]);
    assert_eq!(
        &lines[2][1..],
        &["230", "-10", "100000", "METER-7", "2023.11.14 22:13:20"]
    );
}

#[tokio::test]
async fn test_unreachable_device_writes_no_results() {
    let dir = tempfile::tempdir().unwrap();
    let settings = write_settings(dir.path());
    let fault_log = dir.path().join("faults.log");

    let cycle = PollingCycle::new(
        Arc::new(device().unreachable()),
        Arc::new(CsvResultSink::new(dir.path(), settings.value_addresses())),
        Arc::new(FileFaultLog::new(&fault_log, false)),
    );
    let (_tx, mut rx) = watch::channel(false);

    let outcome = cycle.run(&settings, &mut rx).await.unwrap();

    assert_eq!(outcome, CycleOutcome::SessionUnavailable);
    assert!(csv_files(dir.path()).is_empty());
    assert!(
        std::fs::read_to_string(&fault_log)
            .unwrap()
            .contains("127.0.0.1:1502")
    );
}

#[test]
fn test_host_config_points_at_settings() {
    let dir = tempfile::tempdir().unwrap();
    write_settings(dir.path());

    let config_path = dir.path().join("master.json5");
    std::fs::write(
        &config_path,
        format!(
            "{{ settings_file: {:?}, output_dir: {:?} }}",
            dir.path().join("settings.ini").display().to_string(),
            dir.path().display().to_string()
        ),
    )
    .unwrap();

    let config = HostConfig::load_from_file(&config_path).unwrap();
    let settings = MasterSettings::load(&config.settings_file).unwrap();

    assert_eq!(settings.device_id, 3);
    assert_eq!(settings.groups.len(), 3);
}
