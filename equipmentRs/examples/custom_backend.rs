use std::time::Duration;

use equipmentrs::{
    Backend, ConnectOptions, EchoTransport, Family, MessageInterface, Registration, Registry,
    SocketTransport,
};

fn main() {
    env_logger::init();

    // Start from the builtin transports and route one model to a simulated device.
    let registry = Registry::with_builtin_defaults();
    let simulated = Backend::message(
        "simulated",
        |_, _| Ok(EchoTransport::new()),
        b"\n",
        b"\n",
    );
    registry
        .register(
            Registration::new(simulated)
                .family(Family::Socket)
                .model("^SIM-")
                .unwrap(),
        )
        .unwrap();

    // Devices of another vendor speak over the same socket but want `\r` terminations.
    let acme = Backend::message("acme", SocketTransport::open, b"\r", b"\r");
    registry
        .register(Registration::new(acme).manufacturer("acme").unwrap())
        .unwrap();

    let options = ConnectOptions::default()
        .with_timeout(Some(Duration::from_millis(500)))
        .with_model("SIM-100");
    let mut conn = registry.connect("TCP::localhost::5025", options).unwrap();
    println!("Connected to {}", conn.name());
    println!("Echo: {}", conn.query_str("hello").unwrap());
}
