//! Test Transaction Producer
//!
//! Generates and publishes synthetic blockchain transactions to NATS in the
//! feed's wire format, for pipeline testing.

use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Synthetic transaction generator covering typical, whale, and anomalous
/// traffic shapes.
struct TransactionGenerator {
    rng: rand::rngs::ThreadRng,
    transaction_counter: u64,
}

impl TransactionGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
            transaction_counter: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.transaction_counter += 1;
        format!("{:016x}{:048x}", self.rng.gen::<u64>(), self.transaction_counter)
    }

    fn address(&mut self) -> String {
        format!("1Addr{:08x}", self.rng.gen_range(0..50_000u64))
    }

    /// Typical transaction: modest value, couple of inputs and outputs.
    fn generate_legitimate(&mut self) -> serde_json::Value {
        let hash = self.next_id();
        let value: u64 = self.rng.gen_range(10_000..5_000_000);
        let fee: u64 = self.rng.gen_range(200..5_000);
        let in_count = self.rng.gen_range(1..=3);
        let out_count = self.rng.gen_range(1..=3);

        self.feed_message(&hash, value, fee, in_count, out_count)
    }

    /// Whale transaction: value well above the deterministic threshold.
    fn generate_whale(&mut self) -> serde_json::Value {
        let hash = self.next_id();
        let value: u64 = self.rng.gen_range(1_000_000_000..50_000_000_000);
        let fee: u64 = self.rng.gen_range(10_000..100_000);
        let in_count = self.rng.gen_range(1..=5);

        self.feed_message(&hash, value, fee, in_count, 2)
    }

    /// Anomalous transaction: extreme fan-out and fee relative to value.
    fn generate_anomalous(&mut self) -> serde_json::Value {
        let hash = self.next_id();
        let value: u64 = self.rng.gen_range(100_000_000..2_000_000_000);
        let fee: u64 = self.rng.gen_range(5_000_000..50_000_000);
        let in_count = self.rng.gen_range(30..80);
        let out_count = self.rng.gen_range(50..150);

        self.feed_message(&hash, value, fee, in_count, out_count)
    }

    fn feed_message(
        &mut self,
        hash: &str,
        total_value: u64,
        fee: u64,
        input_count: usize,
        output_count: usize,
    ) -> serde_json::Value {
        let inputs: Vec<serde_json::Value> = (0..input_count)
            .map(|_| {
                json!({
                    "prev_out": {
                        "addr": self.address(),
                        "value": total_value / input_count.max(1) as u64
                    }
                })
            })
            .collect();

        let outputs: Vec<serde_json::Value> = (0..output_count)
            .map(|_| {
                json!({
                    "addr": self.address(),
                    "value": total_value / output_count.max(1) as u64
                })
            })
            .collect();

        json!({
            "op": "utx",
            "x": {
                "hash": hash,
                "time": chrono::Utc::now().timestamp(),
                "fee": fee,
                "inputs": inputs,
                "out": outputs
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    info!("Starting Test Transaction Producer");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let nats_url = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("nats://localhost:4222");
    let subject = args.get(2).map(|s| s.as_str()).unwrap_or("transactions");
    let count: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(100);
    let anomaly_rate: f64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.01);
    let whale_rate: f64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(0.02);
    let delay_ms: u64 = args.get(6).and_then(|s| s.parse().ok()).unwrap_or(100);

    info!(
        nats_url = %nats_url,
        subject = %subject,
        count = count,
        anomaly_rate = anomaly_rate,
        whale_rate = whale_rate,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    // Connect to NATS
    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, anomaly_rate, whale_rate, delay_ms).await;
        }
    };

    // Generate and publish transactions
    let mut generator = TransactionGenerator::new();
    let mut rng = rand::thread_rng();

    info!("Starting to publish {} transactions...", count);

    let mut legitimate_count = 0u64;
    let mut whale_count = 0u64;
    let mut anomalous_count = 0u64;

    for i in 0..count {
        let roll: f64 = rng.gen();
        let message = if roll < anomaly_rate {
            anomalous_count += 1;
            generator.generate_anomalous()
        } else if roll < anomaly_rate + whale_rate {
            whale_count += 1;
            generator.generate_whale()
        } else {
            legitimate_count += 1;
            generator.generate_legitimate()
        };

        let payload = serde_json::to_vec(&message)?;
        client.publish(subject.to_string(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} transactions ({} legitimate, {} whales, {} anomalous)",
                i + 1,
                count,
                legitimate_count,
                whale_count,
                anomalous_count
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    info!(
        "Completed! Published {} transactions ({} legitimate, {} whales, {} anomalous)",
        count, legitimate_count, whale_count, anomalous_count
    );

    Ok(())
}

async fn run_dry_mode(
    count: u64,
    anomaly_rate: f64,
    whale_rate: f64,
    delay_ms: u64,
) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = TransactionGenerator::new();
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let roll: f64 = rng.gen();
        let message = if roll < anomaly_rate {
            generator.generate_anomalous()
        } else if roll < anomaly_rate + whale_rate {
            generator.generate_whale()
        } else {
            generator.generate_legitimate()
        };

        if (i + 1) % 10 == 0 || i == 0 {
            let json = serde_json::to_string_pretty(&message)?;
            info!("Sample transaction {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}
