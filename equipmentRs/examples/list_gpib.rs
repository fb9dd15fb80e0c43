use equipmentrs::{ConnectOptions, GpibTransport, MessageInterface, connect};

fn main() {
    env_logger::init();

    // `None` loads the library from `GPIB_LIBRARY` or the platform default.
    let listeners = GpibTransport::find_listeners(None, false).unwrap();
    if listeners.is_empty() {
        println!("No GPIB listeners found.");
        return;
    }

    for address in listeners {
        let options = ConnectOptions::default().with_rstrip(true);
        match connect(&address, options).and_then(|mut conn| conn.query_str("*IDN?")) {
            Ok(idn) => println!("{address}: {idn}"),
            Err(e) => println!("{address}: {e}"),
        }
    }
}
