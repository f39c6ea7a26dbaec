//! Segmented Exchange Example
//!
//! Two BACnet/IP devices on the loopback interface. The client writes a large
//! WritePropertyMultiple request that has to be segmented; the server answers with a
//! ComplexAck large enough to come back segmented too. Both devices accept at most 206
//! octet APDUs so every step of the windowed transfer shows up in the log.
//!
//! Run with `RUST_LOG=debug` (or `trace` for frame dumps).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bacnet_appservice::app::runtime::{bind_datalink, ApplicationService};
use bacnet_appservice::app::{
    Apdu, ApplicationConfig, MaxApduSize, MaxSegments, Pdu, Segmentation, StateMachineAccessPoint,
};
use bacnet_appservice::datalink::{BipDataLink, DataLink};
use bacnet_appservice::service::ConfirmedServiceChoice;
use bytes::Bytes;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BACnet Segmented Exchange Example");
    println!("=================================\n");

    let config = ApplicationConfig::default()
        .with_max_apdu_length_accepted(MaxApduSize::Up206)
        .with_segmentation(Segmentation::Both)
        .with_max_segments_accepted(MaxSegments::SixtyFour)
        .with_proposed_window_size(4)
        .with_apdu_timeout(Duration::from_secs(2));

    let loopback: SocketAddr = "127.0.0.1:0".parse()?;
    let client_link = Arc::new(BipDataLink::new(loopback, loopback).await?);
    let server_link = Arc::new(BipDataLink::new(loopback, loopback).await?);
    let client_addr = client_link.local_address();
    let server_addr = server_link.local_address();
    println!("Client at {}", client_addr);
    println!("Server at {}\n", server_addr);

    let client = ApplicationService::spawn(StateMachineAccessPoint::new(config.clone()));
    let server = ApplicationService::spawn(StateMachineAccessPoint::new(config));
    bind_datalink(client_link, client.handle.clone(), client.to_network);
    bind_datalink(server_link, server.handle.clone(), server.to_network);

    let server_handle = server.handle.clone();
    let mut server_app = server.to_application;
    let responder = tokio::spawn(async move {
        while let Some(pdu) = server_app.recv().await {
            let Apdu::ConfirmedRequest {
                invoke_id,
                service_choice,
                service_data,
                ..
            } = pdu.apdu
            else {
                continue;
            };
            println!(
                "Server: {:?} #{} with {} octets",
                service_choice,
                invoke_id,
                service_data.len()
            );

            // Echo the data back twice over
            let mut reply = service_data.to_vec();
            reply.extend_from_slice(&service_data);
            let ack = Apdu::ComplexAck {
                segmented: false,
                more_follows: false,
                invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice: service_choice as u8,
                service_data: Bytes::from(reply),
            };
            let Some(source) = pdu.source else {
                continue;
            };
            if let Err(e) = server_handle.respond(Pdu::to(source, ack)).await {
                eprintln!("Server: reply failed: {}", e);
            }
        }
    });

    let payload: Vec<u8> = (0..900u32).map(|i| (i % 251) as u8).collect();
    let invoke_id = client
        .handle
        .confirmed_request(
            server_addr,
            ConfirmedServiceChoice::WritePropertyMultiple,
            Bytes::from(payload.clone()),
        )
        .await?;
    println!("Client: sent request #{} with {} octets", invoke_id, payload.len());

    let mut client_app = client.to_application;
    let confirmation = tokio::time::timeout(Duration::from_secs(10), client_app.recv()).await?;
    match confirmation.map(|pdu| pdu.apdu) {
        Some(Apdu::ComplexAck { service_data, .. }) => {
            println!("Client: ComplexAck with {} octets", service_data.len());
            assert_eq!(service_data.len(), payload.len() * 2);
        }
        Some(other) => println!("Client: unexpected {:?}", other.apdu_type()),
        None => println!("Client: service stopped"),
    }

    client.handle.shutdown().await?;
    server.handle.shutdown().await?;
    responder.abort();

    println!("\nDone.");
    Ok(())
}
