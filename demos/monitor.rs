use std::env;
use std::time::Duration;

use vesta_local::{AlarmState, Coordinator, Event, VestaClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let usage = "usage: monitor <host> <user> <password> [--tls] [--interval <secs>]";
    let host = args.get(1).expect(usage);
    let user = args.get(2).expect(usage);
    let pass = args.get(3).expect(usage);
    let use_tls = args.iter().any(|a| a == "--tls");
    let interval = args
        .iter()
        .position(|a| a == "--interval")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(vesta_local::DEFAULT_UPDATE_INTERVAL);

    let client = VestaClient::builder(host.as_str())
        .credentials(user.as_str(), pass.as_str())
        .use_tls(use_tls)
        .build()?;

    println!("Connecting to {host}...");
    let coordinator = Coordinator::builder(client)
        .update_interval(interval)
        .on_event(|event| match event {
            Event::AlarmTriggered { entry } => println!("!!! ALARM: {entry}"),
            Event::NewLogEntries { entries } => {
                for entry in entries.iter().rev() {
                    println!("log: {entry}");
                }
            }
            other => println!("{other:?}"),
        })
        .setup()
        .await?;

    if let Some(data) = coordinator.data() {
        let state = data.alarm_state(coordinator.trigger_rules());
        println!(
            "Connected. Panel mode: {} ({state:?}), {} devices, GSM {}%",
            data.panel.mode,
            data.devices.len(),
            data.panel.gsm_signal,
        );
        if state == AlarmState::Unknown {
            println!("Panel reported an unrecognised mode string");
        }
        for device in &data.devices {
            println!(
                "  [{}/{}] {} ({}): {}",
                device.area,
                device.zone,
                device.name,
                device.model_name(),
                device.status
            );
        }
    }

    let mut status = coordinator.subscribe_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let vesta_local::UpdateStatus::Failing(failed) = current {
                    eprintln!("Update failed: {failed}");
                }
            }
        }
    }

    println!("Shutting down...");
    coordinator.shutdown().await;
    Ok(())
}
