//! End-to-end runs of the driver against the synthetic collaborators.

use anyhow::Result;
use netlab_core::error::{ConfigError, NetlabError, TraceError};
use netlab_core::flow::FlowId;
use netlab_core::topology::LinkId;
use netlab_core::trace::Property;
use netlab_core::{Experiment, ExperimentConfig, SimTime};
use netlab_testbed::collaborators;

/// client - gw0 = gw1 - server. `lossy` carries traffic until the
/// make-before-break failover onto `slow` at 3 s.
const FAILOVER: &str = r#"
    name = "failover"
    stop_time = "6s"
    nodes = ["client", "gw0", "gw1", "server"]

    [[links]]
    name = "access"
    a = "client"
    b = "gw0"
    rate = "100Mbps"
    delay = "1ms"

    [[links]]
    name = "lossy"
    a = "gw0"
    b = "gw1"
    rate = "5Mbps"
    delay = "33ms"

    [[links]]
    name = "slow"
    a = "gw0"
    b = "gw1"
    rate = "5Mbps"
    delay = "100ms"
    up = false

    [[links]]
    name = "edge"
    a = "gw1"
    b = "server"
    rate = "100Mbps"
    delay = "1ms"

    [[apps]]
    name = "bulk"
    source = "client"
    sink = "server"
    start = 1
    stop = "5s"

    [[plans]]
    kind = "make_before_break"
    from = "lossy"
    to = "slow"
    at = "3s"
    overlap = "10ms"

    [sampling]
    interval = "100ms"
    first_at = "1s"
    exclude_flows = [2]

    [[traces]]
    node = "server"
    at = 1.5
    after_app = "bulk"

    [[traces]]
    node = "client"
    role = "client"
    at = 1.5
    after_app = "bulk"

    [stack]
    variant = "NewReno"
"#;

fn run(toml: &str) -> Result<(netlab_core::ExperimentReport, netlab_core::sink::SinkRegistry), NetlabError> {
    let config = ExperimentConfig::from_toml_str(toml)?;
    let collab = collaborators(&config)?;
    Experiment::new(config, collab).run_with_sinks()
}

// ─── Failover ────────────────────────────────────────────────────────────────

#[test]
fn failover_keeps_one_path_up_at_all_times() -> Result<()> {
    let (report, _) = run(FAILOVER)?;
    let (lossy, slow) = (LinkId(1), LinkId(2));

    let changes: Vec<_> = report
        .link_changes
        .iter()
        .map(|c| (c.link, c.up, c.at))
        .collect();
    assert_eq!(
        changes,
        vec![
            (slow, true, SimTime::from_millis(3_000)),
            (lossy, false, SimTime::from_millis(3_010)),
        ]
    );

    // Replay the history from the configured initial states.
    let mut up = [true, true, false, true];
    for change in &report.link_changes {
        up[change.link.0 as usize] = change.up;
        assert!(up[1] || up[2], "both gateway links down at {}", change.at);
    }
    assert_eq!(up, [true, false, true, true]);
    Ok(())
}

#[test]
fn traffic_survives_failover() -> Result<()> {
    let (report, _) = run(FAILOVER)?;
    let data = report.flow(FlowId(1)).expect("data flow reported");
    assert!(data.rx_bytes > 0);
    assert!(data.rx_packets <= data.tx_packets);

    let after: Vec<_> = report
        .samples_for(FlowId(1))
        .iter()
        .filter(|s| s.time > SimTime::from_millis(3_500) && s.time <= SimTime::from_millis(5_000))
        .collect();
    assert!(!after.is_empty());
    assert!(after.iter().any(|s| s.interval_throughput_bps > 0.0));
    assert!(report
        .samples_for(FlowId(1))
        .iter()
        .all(|s| s.interval_throughput_bps >= 0.0));
    Ok(())
}

// ─── Statistics ──────────────────────────────────────────────────────────────

#[test]
fn excluded_ack_flow_is_absent_everywhere() -> Result<()> {
    let (report, sinks) = run(FAILOVER)?;
    assert!(report.flow(FlowId(1)).is_some());
    assert!(report.flow(FlowId(2)).is_none());
    assert!(report.samples_for(FlowId(2)).is_empty());
    assert!(sinks.rows("flow2-throughput-run0.txt").is_none());
    assert!(sinks.row_count("flow1-throughput-run0.txt") > 0);

    let text = report.render_text();
    assert!(text.contains("Flow 1 ("));
    assert!(!text.contains("Flow 2 ("));
    Ok(())
}

#[test]
fn samples_follow_the_sampling_grid() -> Result<()> {
    let (report, _) = run(FAILOVER)?;
    let samples = report.samples_for(FlowId(1));
    assert!(!samples.is_empty());
    for s in samples {
        assert!(s.time >= SimTime::from_millis(1_000));
        assert_eq!(s.time.as_nanos() % 100_000_000, 0, "off-grid sample at {}", s.time);
    }
    assert!(samples.windows(2).all(|w| w[0].time < w[1].time));
    assert_eq!(samples.last().map(|s| s.time), Some(SimTime::from_millis(6_000)));
    Ok(())
}

#[test]
fn off_grid_stop_time_gets_a_closing_sample() -> Result<()> {
    let toml = FAILOVER.replace(r#"stop_time = "6s""#, r#"stop_time = "5.95s""#);
    let (report, sinks) = run(&toml)?;

    let samples = report.samples_for(FlowId(1));
    let (last, on_grid) = samples.split_last().expect("samples");
    assert_eq!(last.time, SimTime::from_millis(5_950));
    assert!(on_grid.iter().all(|s| s.time.as_nanos() % 100_000_000 == 0));
    assert!(samples.windows(2).all(|w| w[0].time < w[1].time));

    let rows = sinks.rows("flow1-throughput-run0.txt").expect("throughput sink");
    assert!(rows.last().expect("rows").starts_with("5.95\t"));
    Ok(())
}

// ─── Traces ──────────────────────────────────────────────────────────────────

#[test]
fn standard_traces_write_rows_after_activation() -> Result<()> {
    let (report, sinks) = run(FAILOVER)?;

    let rx = sinks.rows("server-rx-data-3-run0.txt").expect("server rx sink");
    assert!(!rx.is_empty());
    for row in rx {
        let t: f64 = row.split('\t').next().unwrap().parse()?;
        assert!(t >= 1.5, "row before activation: {row}");
    }

    let cwnd = sinks.rows("client-cwnd-change-0-run0.txt").expect("client cwnd sink");
    assert!(!cwnd.is_empty());
    assert_eq!(cwnd[0].split('\t').count(), 3);

    assert!(report
        .traces
        .bindings
        .iter()
        .any(|b| b.property == Property::Rtt && b.path.starts_with("node0/")));
    assert!(report.traces.unmatched_patterns.is_empty());
    Ok(())
}

#[test]
fn missing_mandatory_property_aborts_the_run() {
    let toml = FAILOVER.replace(
        "[stack]\n    variant = \"NewReno\"",
        "[stack]\n    variant = \"NewReno\"\n    receive_window = false",
    );
    let toml = toml.replace(
        "node = \"server\"\n    at = 1.5",
        "node = \"server\"\n    at = 1.5\n    requests = [{ property = \"rwnd\", instance = 0 }]",
    );
    let err = run(&toml).unwrap_err();
    assert!(
        matches!(
            err,
            NetlabError::Trace(TraceError::MissingProperty {
                property: Property::ReceiveWindow,
                ..
            })
        ),
        "unexpected error: {err}"
    );
}

#[test]
fn lossy_link_fills_drop_sink() -> Result<()> {
    let toml = FAILOVER.replace(
        "delay = \"33ms\"",
        "delay = \"33ms\"\n    loss = { kind = \"rate\", probability = 0.1 }",
    );
    let (report, sinks) = run(&toml)?;
    assert!(report.traces.phy_drops > 0);
    let drops = sinks.rows("phy-rx-drop-run0.txt").expect("drop sink always open");
    assert_eq!(drops.len() as u64, report.traces.phy_drops);
    assert!(drops.iter().all(|r| r.ends_with("\tlink1")));
    Ok(())
}

// ─── Setup Errors ────────────────────────────────────────────────────────────

#[test]
fn unknown_transport_variant_is_rejected() -> Result<()> {
    let toml = FAILOVER.replace("variant = \"NewReno\"", "variant = \"QuicVegas\"");
    let config = ExperimentConfig::from_toml_str(&toml)?;
    let err = collaborators(&config).unwrap_err();
    assert_eq!(err, ConfigError::UnknownProtocol("QuicVegas".into()));
    Ok(())
}

// ─── Datagrams and Probes ────────────────────────────────────────────────────

const ATTACK: &str = r#"
    name = "onoff"
    stop_time = "3s"
    nodes = ["attacker", "router", "victim"]

    [[links]]
    name = "uplink"
    a = "attacker"
    b = "router"
    rate = "10Mbps"
    delay = "5ms"

    [[links]]
    name = "downlink"
    a = "router"
    b = "victim"
    rate = "10Mbps"
    delay = "5ms"

    [[apps]]
    name = "cbr"
    kind = "onoff"
    source = "attacker"
    sink = "victim"
    port = 50000
    rate = "2Mbps"
    packet_size = 1000
    on = "200ms"
    off = "200ms"
    start = "0.5s"

    [[probes]]
    app = "cbr"
    interval = "100ms"

    [[plans]]
    kind = "flapping"
    link = "downlink"
    start = "1s"
    end = "2.5s"
    mean_up = "200ms"
    mean_down = "50ms"
"#;

#[test]
fn onoff_traffic_throughput_is_sampled() -> Result<()> {
    let (report, sinks) = run(ATTACK)?;
    assert_eq!(report.flows.len(), 1);
    let flow = &report.flows[0];
    assert_eq!(flow.tuple.destination_port, 50000);
    assert!(flow.rx_packets > 0);
    assert_eq!(flow.rx_packets + flow.lost_packets, flow.tx_packets);

    let probe = &report.probes[0];
    assert_eq!(probe.app, "cbr");
    assert!(probe.points.iter().any(|p| p.kbps > 0.0));
    assert!(probe.points.iter().any(|p| p.kbps == 0.0));
    assert_eq!(
        sinks.row_count("app-cbr-throughput-run0.txt") as usize,
        probe.points.len()
    );
    Ok(())
}

#[test]
fn same_seed_same_report() -> Result<()> {
    let (a, _) = run(ATTACK)?;
    let (b, _) = run(ATTACK)?;
    assert_eq!(a.to_json()?, b.to_json()?);

    let other = ATTACK.replace("name = \"onoff\"", "name = \"onoff\"\n    run = 1");
    let (c, _) = run(&other)?;
    assert_eq!(c.run, 1);
    assert_ne!(
        a.link_changes.iter().map(|l| l.at).collect::<Vec<_>>(),
        c.link_changes.iter().map(|l| l.at).collect::<Vec<_>>()
    );
    Ok(())
}
