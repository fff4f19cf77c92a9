use std::time::Duration;

use doip_client::{
    channel::DoipChannel,
    driver::{AlwaysReady, CycleSettings, CyclicDriver},
    transport::{
        blocking::BlockingTcpChannel,
        event::{EventChannel, ThreadedTcpStack},
    },
    uds::DataIdentifier,
    DoipClient, DoipClientSettings,
};
use strum::IntoEnumIterator;

extern crate doip_client;

// Usage: cyclic_client [blocking|event] [once]
fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let backend = args.next().unwrap_or_else(|| "blocking".into());
    let once = args.next().as_deref() == Some("once");

    let settings = DoipClientSettings::default();
    let channel: Box<dyn DoipChannel> = match backend.as_str() {
        "event" => Box::new(EventChannel::new(ThreadedTcpStack::new())),
        _ => Box::new(BlockingTcpChannel::new()),
    };
    let mut client = DoipClient::new(channel, settings);
    println!("DoIP client using the {backend} backend");

    if once {
        let vehicle = match client.discover(settings.discovery_timeout_ms) {
            Ok(v) => v,
            Err(e) => {
                println!("No vehicle found: {e}");
                return;
            }
        };
        println!("Found {vehicle:#?}");
        if let Err(e) = client.connect_and_activate(&vehicle, settings.tcp_timeout_ms) {
            println!("Routing activation failed: {e}");
            return;
        }
        for did in DataIdentifier::iter() {
            match client.read_data_by_identifier(did) {
                Ok(value) => println!("{did}: {}", String::from_utf8_lossy(&value)),
                Err(e) => println!("{did}: {e}"),
            }
        }
        client.disconnect();
        return;
    }

    let handle = CyclicDriver::new(client, AlwaysReady, CycleSettings::default())
        .spawn()
        .unwrap();
    loop {
        std::thread::sleep(Duration::from_secs(5));
        println!(
            "State: {}, cycles: {}, vehicle: {:?}",
            handle.status(),
            handle.cycles(),
            handle.vehicle_info().map(|v| v.vin)
        );
    }
}
