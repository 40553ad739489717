use std::net::{TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use bearerbox::box_conn::{run_accept_loop, run_delivery_pump, BoxKind};
use bearerbox::config::Config;
use bearerbox::driver::Dialect;
use bearerbox::router::{run_sms_router, run_udp_receiver, run_wdp_router};
use bearerbox::supervisor::State;
use bearerbox::{admin, pidfile, smsc, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about = "SMS/WAP gateway bearerbox", long_about = None)]
struct Args {
    /// Path to the group-based key/value configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit without starting.
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    if args.check_config {
        info!("configuration OK: {} smsc(s) configured", config.smsc.len());
        return Ok(());
    }

    if let Some(pid_file) = &config.core.pid_file {
        pidfile::write(&PathBuf::from(pid_file)).context("writing pid file")?;
    }

    let supervisor = Arc::new(Supervisor::new(config.core.heartbeat_freq));
    // Hold a standing registration on `flow_threads` for the lifetime of
    // startup, so its producer-count can never be observed at zero before
    // every spawned worker below has had a chance to register its own.
    supervisor.flow_threads.add_producer();
    // Hold the process-level stake on each global queue that
    // `Supervisor::shutdown` (§4.9) deregisters. Per-connection producers
    // (each SMSC receiver on `incoming_*`) add their own on top of this;
    // the queue only drains once every stake — this one plus every
    // connection's own — has been removed.
    supervisor.incoming_sms.add_producer();
    supervisor.incoming_wdp.add_producer();
    supervisor.outgoing_sms.add_producer();
    supervisor.outgoing_wdp.add_producer();

    for smsc_cfg in &config.smsc {
        let dialect = Dialect::parse(&smsc_cfg.dialect)
            .with_context(|| format!("smsc '{}' has an invalid dialect", smsc_cfg.smsc_id))?;
        match smsc::start(dialect, smsc_cfg.clone(), Arc::clone(&supervisor)) {
            Ok(id) => info!("started smsc '{}' (registry id {id})", smsc_cfg.smsc_id),
            Err(e) => warn!("failed to start smsc '{}': {e}", smsc_cfg.smsc_id),
        }
    }

    {
        let sup = Arc::clone(&supervisor);
        thread::spawn(move || run_sms_router(sup));
    }
    {
        let sup = Arc::clone(&supervisor);
        thread::spawn(move || run_wdp_router(sup));
    }

    if let Some(udp_port) = config.core.udp_port {
        let socket = UdpSocket::bind(("0.0.0.0", udp_port))
            .with_context(|| format!("binding udp socket on port {udp_port}"))?;
        let recv_socket = socket.try_clone().context("cloning udp socket")?;
        *supervisor.udp_socket.lock().expect("udp socket mutex poisoned") = Some(socket);
        let sup = Arc::clone(&supervisor);
        thread::spawn(move || run_udp_receiver(recv_socket, udp_port, sup));
    }

    let smsbox_listener = TcpListener::bind(("0.0.0.0", config.core.smsbox_port))
        .with_context(|| format!("binding smsbox port {}", config.core.smsbox_port))?;
    {
        let sup = Arc::clone(&supervisor);
        let access = config.smsbox.clone();
        thread::spawn(move || run_accept_loop(smsbox_listener, BoxKind::Sms, sup, access));
    }

    let wapbox_listener = TcpListener::bind(("0.0.0.0", config.core.wapbox_port))
        .with_context(|| format!("binding wapbox port {}", config.core.wapbox_port))?;
    {
        let sup = Arc::clone(&supervisor);
        let access = config.wapbox.clone();
        thread::spawn(move || run_accept_loop(wapbox_listener, BoxKind::Wap, sup, access));
    }

    {
        let sup = Arc::clone(&supervisor);
        thread::spawn(move || run_delivery_pump(BoxKind::Sms, sup));
    }
    {
        let sup = Arc::clone(&supervisor);
        thread::spawn(move || run_delivery_pump(BoxKind::Wap, sup));
    }

    let admin_listener = TcpListener::bind(("0.0.0.0", config.core.admin_port))
        .with_context(|| format!("binding admin port {}", config.core.admin_port))?;
    {
        let sup = Arc::clone(&supervisor);
        let password = config.core.admin_password.clone();
        thread::spawn(move || admin::run(admin_listener, password, sup));
    }

    info!(
        "bearerbox running: smsbox={}, wapbox={}, admin={}",
        config.core.smsbox_port, config.core.wapbox_port, config.core.admin_port
    );

    // Wait for an admin `/shutdown` (or equivalent) to move the supervisor
    // out of Running/Suspended/Isolated.
    while supervisor.state() != State::Shutdown {
        thread::sleep(Duration::from_millis(200));
    }

    // `flow_threads`'s producer-count equals the number of live worker
    // threads; every one of them deregisters on its own exit path as the
    // shutdown avalanche (§4.1/§4.9) reaches it. Release main's own
    // standing registration, then block until the last worker's does too.
    supervisor.flow_threads.remove_producer();
    supervisor.flow_threads.consume();
    supervisor.mark_dead();
    info!("bearerbox shut down cleanly");
    Ok(())
}
