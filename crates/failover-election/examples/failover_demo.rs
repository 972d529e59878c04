//! Failover demonstration
//!
//! Three gateway nodes campaign for the same role on an in-memory coordination
//! store. The leader is then stopped and one of the backups takes over once the
//! lease of the old leader expires.

use failover_election::{
    ElectionFactory, FailoverConfig, LeaderElector, MemoryStore, SessionConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Starting Failover Election Demo");

    let store = Arc::new(MemoryStore::new());
    let watch_dir = "/group0";
    let leader_key = ElectionFactory::leader_key(watch_dir, "gateway");

    // Check store health every second instead of every five
    let session_config = SessionConfig {
        health_check_interval: Duration::from_secs(1),
        ..SessionConfig::default()
    };

    // Observer of every role under the group prefix
    let observer = ElectionFactory::new(store.clone(), FailoverConfig::new("observer"))?
        .with_session_config(session_config);
    let watcher = observer.create_group_watcher(watch_dir);
    watcher.add_change_handler(|key, member| {
        println!(
            "👑 {} is now led by {} (seq {})",
            key,
            member.member_id(),
            member.sequence()
        );
        Ok(())
    });
    watcher.add_delete_handler(|key, member| {
        println!("💀 {} lost its leader {}", key, member.member_id());
        Ok(())
    });
    watcher.start().await?;

    let mut electors: Vec<LeaderElector> = Vec::new();
    for (name, endpoint) in [
        ("gateway-1", "127.0.0.1:30300"),
        ("gateway-2", "127.0.0.1:30301"),
        ("gateway-3", "127.0.0.1:30302"),
    ] {
        let factory = ElectionFactory::new(store.clone(), FailoverConfig::new(name))?
            .with_session_config(session_config);
        let elector = factory.create_leader_elector(
            leader_key.clone(),
            "gateway",
            endpoint.as_bytes().to_vec(),
        )?;

        let member_id = name.to_string();
        elector.on_campaign_result(move |is_leader| {
            if is_leader {
                println!("✅ {} switched to leader", member_id);
            } else {
                println!("⏸️  {} switched to backup", member_id);
            }
        });
        let member_id = name.to_string();
        elector.on_keep_alive_failure(move |e| {
            println!("❌ {} lost its lease: {}", member_id, e);
        });

        elector.start().await?;
        electors.push(elector);
    }

    sleep(Duration::from_millis(500)).await;
    let leader = electors
        .iter()
        .position(|elector| elector.is_leader())
        .ok_or("no leader elected")?;
    println!("\n📊 Current leader: gateway-{}", leader + 1);

    println!("\n🔄 Stopping the leader, waiting for its lease to expire...");
    electors.remove(leader).stop();
    sleep(Duration::from_secs(8)).await;

    for (name, member) in watcher.all_leaders() {
        println!("📊 {} -> {}", name, member.member_id());
    }

    println!("\n🏁 Demo completed!");
    for elector in &electors {
        elector.stop();
    }
    watcher.stop();

    Ok(())
}
