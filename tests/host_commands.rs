//! Host protocol end to end: bytes in on a host channel, replies out, and
//! the resulting bus traffic on a simulated layout.

use twpc_rail::hal::{MockHostChannel, SimBus};
use twpc_rail::packet::checksum;
use twpc_rail::{BusConfig, Config, DeviceConfig, HostConfig, HostLink, Opcode, Station};

const JOIN_CYCLES: usize = 3000;

fn layout(host: HostConfig) -> (Station<SimBus>, HostLink<MockHostChannel>) {
    let config = Config::default()
        .with_bus(BusConfig::default().with_fault_threshold(Some(16)))
        .with_host(host);
    let mut bus = SimBus::new(&config.bus);
    bus.attach(&DeviceConfig::default().with_identity(*b"ASD"));
    let mut station = Station::new(&config, bus);
    let joined = station.run_until(JOIN_CYCLES, |s| {
        s.master().table().get(1).is_some_and(|e| e.is_ready())
    });
    assert!(joined, "train did not join");
    (station, HostLink::new(MockHostChannel::new()))
}

fn send(
    station: &mut Station<SimBus>,
    link: &mut HostLink<MockHostChannel>,
    input: &[u8],
) -> Vec<String> {
    link.channel_mut().clear_output();
    link.channel_mut().feed(input);
    station.service_host(link);
    link.channel().lines().map(String::from).collect()
}

#[test]
fn queries_report_table_state() {
    let (mut station, mut link) = layout(HostConfig::default());
    let replies = send(&mut station, &mut link, b"g i01 i02 l");
    assert_eq!(
        replies,
        [
            "00000001,00000000,00000000,00000000,00000000,00000000,00000000,00000000",
            "415344",
            "nodev",
            "00000000",
        ]
    );
}

#[test]
fn broadcasts_drive_the_train() {
    let (mut station, mut link) = layout(HostConfig::default());
    let replies = send(&mut station, &mut link, b"1 m0ff");
    assert_eq!(replies, ["on", "motor"]);

    station.run_cycles(400);
    let train = station.lines().slave(0).unwrap().actuator();
    assert!(train.light);
    assert_eq!(train.motor_forward, 0xFF);

    let replies = send(&mut station, &mut link, b"0s");
    assert_eq!(replies, ["off", "stopped"]);
    station.run_cycles(400);
    let train = station.lines().slave(0).unwrap().actuator();
    assert!(!train.light);
    assert_eq!(train.speed(), 0);
}

#[test]
fn relayed_packets_are_checked() {
    let (mut station, mut link) = layout(HostConfig::default());
    let cmd = Opcode::MotorB as u8;
    let good = format!("p01{cmd:02X}40{:02X}", checksum(1, cmd, 0x40));
    let bad = format!("p01{cmd:02X}40{:02X}", checksum(1, cmd, 0x40) ^ 0x01);
    let missing = format!("p09{cmd:02X}40{:02X}", checksum(9, cmd, 0x40));

    let replies = send(
        &mut station,
        &mut link,
        format!("{good}{bad}{missing}").as_bytes(),
    );
    assert_eq!(replies, ["ok", "retry", "nodev"]);

    station.run_cycles(400);
    assert_eq!(station.lines().slave(0).unwrap().actuator().motor_reverse, 0x40);
}

#[test]
fn malformed_input_gets_error_replies() {
    let (mut station, mut link) = layout(HostConfig::default());
    let replies = send(&mut station, &mut link, b"z m0x 1");
    assert_eq!(replies, ["?", "err", "on"]);
}

#[test]
fn enumeration_commands_and_notices() {
    let host = HostConfig::default().with_forward_connections(true);
    let (mut station, mut link) = layout(host);

    // the join happened before the link existed; its notice is waiting
    let replies = send(&mut station, &mut link, b"c");
    assert_eq!(replies, ["+01", "con"]);

    station
        .lines_mut()
        .attach(&DeviceConfig::default().with_identity(*b"NEW"));
    assert!(station.run_until(JOIN_CYCLES, |s| {
        s.master().table().get(2).is_some_and(|e| e.is_ready())
    }));
    let replies = send(&mut station, &mut link, b"i02 r");
    assert_eq!(replies, ["+02", "4E4557", "res"]);

    station.lines_mut().unplug(0);
    assert!(station.run_until(JOIN_CYCLES, |s| !s.master().table().contains(1)));
    let replies = send(&mut station, &mut link, b"l");
    assert_eq!(replies, ["-01", "01000001"]);
}

#[test]
fn contact_reports_are_forwarded() {
    let (mut station, mut link) = layout(HostConfig::default());
    station.lines_mut().place(0, Some(1));
    assert!(station.run_until(JOIN_CYCLES, |s| {
        s.scanner().is_some_and(|scan| scan.last_seen(1) == 1)
    }));
    let replies = send(&mut station, &mut link, b"");
    assert_eq!(replies, ["t0101"]);
}
