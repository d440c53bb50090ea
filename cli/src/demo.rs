// Loopback demo — a peripheral and a central exchanging messages in-process

use crate::config::Config;
use anyhow::{Context, Result};
use blelink_core::transport::ble::{
    default_endpoints, pump, Central, EndpointRegistry, LoopbackCentral, LoopbackPeripheral,
    Peripheral, COMMAND_CHAR_UUID, DEV_INFO_CHAR_UUID, DEV_STATUS_CHAR_UUID,
};
use blelink_core::{EndpointId, JsonCodec, LinkEvent, RadioState};
use colored::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const PERIPHERAL_ADDRESS: &str = "d4:36:39:8a:11:02";

fn received(rx: &mut UnboundedReceiver<LinkEvent<Value>>) -> Vec<(EndpointId, Value)> {
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            LinkEvent::Message { endpoint, message } => messages.push((endpoint, message)),
            LinkEvent::Error(e) => println!("  {} {}", "!".bright_red(), e),
            _ => {}
        }
    }
    messages
}

fn endpoint_name(registry: &EndpointRegistry, endpoint: &EndpointId) -> String {
    registry
        .get(endpoint)
        .map(|e| e.name.clone())
        .unwrap_or_else(|| endpoint.to_string())
}

pub async fn run(config: &Config, message: Value) -> Result<()> {
    let link = config.link.clone();
    println!("{}", "blelink loopback demo".bold());
    println!(
        "  MTU {} ({} payload bytes per chunk)",
        link.mtu,
        link.max_chunk_size()
    );
    println!();

    // Peripheral
    let (peripheral, mut peripheral_events) = Peripheral::new(
        link.clone(),
        Arc::new(LoopbackPeripheral::default()),
        default_endpoints(link.mtu),
        JsonCodec,
    )
    .context("Failed to create peripheral")?;
    let peripheral = Arc::new(match config.ack.clone() {
        Some(ack) => peripheral.with_ack(ack),
        None => peripheral,
    });
    peripheral.on_radio_state(RadioState::PoweredOn);
    peripheral.start().context("Failed to start advertising")?;
    println!(
        "  {} Advertising as {}",
        "✓".green(),
        link.device_name.bright_cyan()
    );

    // Central
    let bridge = LoopbackCentral::default();
    bridge.add_peer(PERIPHERAL_ADDRESS);
    let server = peripheral.clone();
    bridge.set_read_handler(move |endpoint| server.on_read_request(endpoint));

    let (central, mut central_events) = Central::new(
        link.clone(),
        Arc::new(bridge),
        default_endpoints(link.mtu),
        JsonCodec,
    )
    .context("Failed to create central")?;
    central.on_radio_state(RadioState::PoweredOn);

    let found = central
        .scan(config.scan_timeout())
        .await
        .context("Scan failed")?;
    println!("  {} Scan found {}", "✓".green(), found.join(", ").bright_cyan());

    central
        .connect(PERIPHERAL_ADDRESS)
        .await
        .context("Connect failed")?;
    pump(&peripheral, &central);
    println!(
        "  {} Connected, subscribed to {} endpoints",
        "✓".green(),
        central.bridge().subscriptions().len()
    );
    println!();

    // Central → peripheral
    let handle = central
        .send(COMMAND_CHAR_UUID, &message)
        .context("Failed to queue command")?;
    let moved = pump(&peripheral, &central);
    handle.await.context("Command was not delivered")?;
    println!(
        "{} {} ({} chunks incl. replies)",
        "central → peripheral".bold(),
        message.to_string().bright_yellow(),
        moved
    );
    for (endpoint, value) in received(&mut peripheral_events) {
        println!(
            "  peripheral got on {}: {}",
            endpoint_name(central.endpoints(), &endpoint),
            value
        );
    }
    for (endpoint, value) in received(&mut central_events) {
        println!(
            "  central got on {}: {}",
            endpoint_name(central.endpoints(), &endpoint),
            value
        );
    }

    // Peripheral → central
    let handle = peripheral
        .send(DEV_STATUS_CHAR_UUID, &message)
        .context("Failed to queue indication")?;
    let moved = pump(&peripheral, &central);
    handle.await.context("Indication was not delivered")?;
    println!(
        "{} {} ({} chunks)",
        "peripheral → central".bold(),
        message.to_string().bright_yellow(),
        moved
    );
    for (endpoint, value) in received(&mut central_events) {
        println!(
            "  central got on {}: {}",
            endpoint_name(central.endpoints(), &endpoint),
            value
        );
    }

    // Chunked read
    let info = json!({
        "name": link.device_name,
        "mtu": link.mtu,
        "version": env!("CARGO_PKG_VERSION"),
    });
    peripheral
        .set_value(DEV_INFO_CHAR_UUID, info)
        .context("Failed to set device info")?;
    let value = central
        .read(DEV_INFO_CHAR_UUID)
        .await
        .context("Read failed")?;
    println!("{} {}", "read dev-info:".bold(), value.to_string().bright_yellow());
    println!();

    central.disconnect().await.context("Disconnect failed")?;
    pump(&peripheral, &central);
    println!(
        "  {} Disconnected; peripheral is {:?}",
        "✓".green(),
        peripheral.state()
    );

    Ok(())
}
