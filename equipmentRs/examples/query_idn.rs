use std::env;
use std::time::Duration;

use equipmentrs::{ConnectOptions, MessageInterface, connect};

const DEFAULT_ADDRESS: &str = "TCPIP::192.168.1.20::INSTR";

fn main() {
    env_logger::init();

    // Pass the address as the first argument, e.g., `ASRL/dev/ttyUSB0` or `TCP::10.0.0.5::5025`.
    let address = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());

    let options = ConnectOptions::default()
        .with_timeout(Some(Duration::from_secs(2)))
        .with_rstrip(true);
    let mut conn = connect(&address, options).unwrap();
    println!("Connected to {}", conn.name());

    let idn = conn.query_str("*IDN?").unwrap();
    println!("Identification: {idn}");

    // Controller operations are only available for some interfaces.
    match conn.read_stb() {
        Ok(stb) => println!("Status byte: {stb:#04x}"),
        Err(e) => println!("Status byte not available: {e}"),
    }

    conn.disconnect().unwrap();
}
