mod fleet;

use fleet::Fleet;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::env;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse()
        .unwrap_or(1883);
    let interval_secs: u64 = env::var("INTERVAL_SECS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);
    let gateways: usize = env::var("GATEWAYS")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .unwrap_or(2);
    let endpoints: usize = env::var("ENDPOINTS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .unwrap_or(3);
    let sensors: usize = env::var("SENSORS")
        .unwrap_or_else(|_| "4".to_string())
        .parse()
        .unwrap_or(4);

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting silo fleet simulator");
    info!(
        "Broker: {}:{}, {} gateways x {} endpoints x {} sensors, every {}s",
        mqtt_broker, mqtt_port, gateways, endpoints, sensors, interval_secs
    );

    let mut rng = rand::thread_rng();
    let client_id = format!("sim-{}", rng.gen::<u32>());

    // Connect to MQTT broker
    let mut mqtt_options = MqttOptions::new(&client_id, &mqtt_broker, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish fleet reports");

    let mut fleets: Vec<Fleet> = (1..=gateways)
        .map(|i| Fleet::new(format!("G{:02}", i), endpoints, sensors))
        .collect();
    let interval = Duration::from_secs(interval_secs);
    let mut cycles = 0u64;

    loop {
        for fleet in &mut fleets {
            fleet.tick(interval_secs);

            publish(&client, "gateway/gateway", &fleet.gateway_payload(&mut rng)).await;
            publish(&client, "gateway/endpoint", &fleet.endpoint_batch(&mut rng)).await;
            publish(&client, "gateway/sensor", &fleet.sensor_batch(&mut rng)).await;
        }

        // Legacy scalar topics, bare numeric text on purpose.
        let temp = format!("{:.1}", rng.gen_range(15.0..30.0));
        if let Err(e) = client
            .publish("temperature", QoS::AtLeastOnce, false, temp)
            .await
        {
            warn!("Failed to publish: {}", e);
        }
        let co2 = format!("{}", rng.gen_range(380..900));
        if let Err(e) = client.publish("co2", QoS::AtLeastOnce, false, co2).await {
            warn!("Failed to publish: {}", e);
        }

        cycles += 1;
        if cycles % 60 == 0 {
            info!("Published {} report cycles", cycles);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn publish<T: Serialize>(client: &AsyncClient, topic: &str, payload: &T) {
    let body = match serde_json::to_string(payload) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize payload for {}: {}", topic, e);
            return;
        }
    };
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
        warn!("Failed to publish to {}: {}", topic, e);
    }
}
