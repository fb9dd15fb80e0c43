use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use equipmentrs::{EquipmentRecord, MessageInterface};

const RECORD: &str = r#"{
    "manufacturer": "Acme",
    "model": "PS-1",
    "serial": "0042",
    "address": "TCP::192.168.1.70::5025",
    "properties": {"timeout": 1.5, "termination": "\n"}
}"#;

fn main() {
    env_logger::init();

    let record: EquipmentRecord = serde_json::from_str(RECORD).unwrap();
    let conn = Arc::new(Mutex::new(record.connect().unwrap()));

    // A long blocking read can be cancelled from any other thread.
    let abort = conn.lock().abort_handle();

    // Each thread holds the lock for a whole query, so a query never mixes with another one.
    let poller = {
        let conn = conn.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                let voltage = conn.lock().query_str("MEAS:VOLT?").unwrap();
                println!("Thread 1: voltage is {voltage}");
                thread::sleep(Duration::from_millis(500));
            }
        })
    };

    let setter = {
        let conn = conn.clone();
        thread::spawn(move || {
            for i in 0..5 {
                conn.lock().write_str(&format!("VOLT {}", i as f64 * 0.5)).unwrap();
                println!("Thread 2: set voltage");
                thread::sleep(Duration::from_secs(1));
            }
        })
    };

    poller.join().unwrap();
    setter.join().unwrap();

    if let Some(abort) = abort {
        abort.abort();
    }
    conn.lock().disconnect().unwrap();
    println!("Done.");
}
