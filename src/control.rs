//! ControlServer: a UDP listener exposing a tiny OSC-style method table
//! authenticated by the per-boot token. Runs on its own thread and never
//! blocks the Orchestrator's main task.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rosc::{OscPacket, OscType};

use crate::constants::{CONTROL_SOCKET_BUFFER_SIZE, CONTROL_SOCKET_READ_TIMEOUT};
use crate::exit_promise::ExitPromise;
use crate::killswitch::KillSwitch;
use crate::logging::Logger;
use crate::supervisors::BeamSupervisor;
use crate::token::Token;

/// The bound UDP control server. Dropping this (or calling `shutdown`) stops
/// the receive loop and joins its thread.
pub struct ControlServer {
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
    /// Bind to loopback:`port` and start the receive loop on its own thread.
    pub fn start(
        port: u16,
        token: Token,
        logger: Arc<Logger>,
        kill_switch: Arc<KillSwitch>,
        exit: Arc<ExitPromise>,
        beam: Arc<BeamSupervisor>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))?;
        socket.set_read_timeout(Some(CONTROL_SOCKET_READ_TIMEOUT))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_bg = shutdown.clone();

        let handle = thread::Builder::new()
            .name("control-server".into())
            .spawn(move || {
                let mut buf = [0u8; CONTROL_SOCKET_BUFFER_SIZE];
                while !shutdown_bg.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, _src)) => {
                            dispatch(&buf[..len], token, &logger, &kill_switch, &exit, &beam);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            logger.error("control server recv", &e);
                        }
                    }
                }
            })
            .expect("failed to spawn control-server thread");

        Ok(ControlServer {
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the receive loop and join its thread. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

/// Parse one inbound datagram and dispatch to the matching control method.
/// Decode failures and token mismatches are both logged and dropped; neither
/// ever causes the receive loop to exit.
fn dispatch(
    data: &[u8],
    token: Token,
    logger: &Logger,
    kill_switch: &KillSwitch,
    exit: &ExitPromise,
    beam: &BeamSupervisor,
) {
    let packet = match rosc::decoder::decode_udp(data) {
        Ok((_, packet)) => packet,
        Err(e) => {
            logger.log(&format!("control server: malformed packet dropped ({e:?})"));
            return;
        }
    };

    match packet {
        OscPacket::Message(msg) => dispatch_message(&msg, token, logger, kill_switch, exit, beam),
        OscPacket::Bundle(bundle) => {
            for nested in bundle.content {
                if let OscPacket::Message(msg) = nested {
                    dispatch_message(&msg, token, logger, kill_switch, exit, beam);
                }
            }
        }
    }
}

fn dispatch_message(
    msg: &rosc::OscMessage,
    token: Token,
    logger: &Logger,
    kill_switch: &KillSwitch,
    exit: &ExitPromise,
    beam: &BeamSupervisor,
) {
    let Some(msg_token) = msg.args.first().and_then(as_int) else {
        logger.log(&format!("control server: {} missing token arg", msg.addr));
        return;
    };

    match msg.addr.as_str() {
        "/daemon/keep-alive" => {
            if msg_token == token.value() {
                kill_switch.keep_alive();
            } else {
                logger.log("control server: keep-alive token mismatch");
            }
        }
        "/daemon/exit" => {
            if msg_token == token.value() {
                exit.deliver();
            } else {
                logger.log("control server: exit token mismatch");
            }
        }
        "/daemon/restart-tau" => {
            if msg_token == token.value() {
                beam.restart();
            } else {
                logger.log("control server: restart-tau token mismatch");
            }
        }
        "/tau/pid" => {
            if msg_token == token.value() {
                if let Some(pid) = msg.args.get(1).and_then(as_int) {
                    beam.pid_promise().fulfill(pid as u32);
                } else {
                    logger.log("control server: /tau/pid missing pid arg");
                }
            } else {
                logger.log("control server: tau/pid token mismatch");
            }
        }
        other => {
            logger.log(&format!("control server: unknown address {other} dropped"));
        }
    }
}

fn as_int(arg: &OscType) -> Option<i32> {
    match arg {
        OscType::Int(i) => Some(*i),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as ClientSocket;
    use std::time::Duration;

    fn fresh_logger() -> Arc<Logger> {
        Arc::new(Logger::open(std::env::temp_dir().join(format!(
            "sonic_daemon_control_test_{}_{}.log",
            std::process::id(),
            rand::random::<u64>()
        ))))
    }

    fn free_port() -> u16 {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.local_addr().unwrap().port()
    }

    fn test_beam() -> Arc<BeamSupervisor> {
        let spec = crate::supervisors::BeamChildSpec {
            launcher_script: "true".to_string(),
            cues_on: true,
            udp_loopback_restricted: true,
            midi_on: false,
            link_on: false,
            udp_cues_port: 4560,
            api_port: free_port(),
            spider_port: free_port(),
            daemon_port: free_port(),
            log_path: "/tmp/beam.log".to_string(),
            midi_enabled: false,
            link_enabled: false,
            phx_port: free_port(),
            token: Token::generate(),
            environment: "dev".to_string(),
        };
        Arc::new(BeamSupervisor::boot(
            Arc::new(crate::platform::UnixDesktop),
            fresh_logger(),
            spec,
            None,
        ))
    }

    #[test]
    fn test_keep_alive_with_correct_token_arms_kill_switch() {
        let port = free_port();
        let token = Token::generate();
        let logger = fresh_logger();
        let kill_switch = Arc::new(KillSwitch::start(logger.clone(), Arc::new(ExitPromise::new())));
        let exit = Arc::new(ExitPromise::new());
        let beam = test_beam();

        let server =
            ControlServer::start(port, token, logger, kill_switch.clone(), exit, beam).unwrap();

        let client = ClientSocket::bind("127.0.0.1:0").unwrap();
        let packet = OscPacket::Message(rosc::OscMessage {
            addr: "/daemon/keep-alive".to_string(),
            args: vec![OscType::Int(token.value())],
        });
        let encoded = rosc::encoder::encode(&packet).unwrap();
        client
            .send_to(&encoded, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        server.shutdown();
        kill_switch.deactivate();
    }

    #[test]
    fn test_wrong_token_exit_does_not_deliver() {
        let port = free_port();
        let token = Token::generate();
        let logger = fresh_logger();
        let kill_switch = Arc::new(KillSwitch::start(logger.clone(), Arc::new(ExitPromise::new())));
        let exit = Arc::new(ExitPromise::new());
        let beam = test_beam();

        let server = ControlServer::start(
            port,
            token,
            logger,
            kill_switch.clone(),
            exit.clone(),
            beam,
        )
        .unwrap();

        let client = ClientSocket::bind("127.0.0.1:0").unwrap();
        let packet = OscPacket::Message(rosc::OscMessage {
            addr: "/daemon/exit".to_string(),
            args: vec![OscType::Int(token.value() + 1)],
        });
        let encoded = rosc::encoder::encode(&packet).unwrap();
        client
            .send_to(&encoded, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert!(!exit.is_delivered());
        server.shutdown();
        kill_switch.deactivate();
    }

    #[test]
    fn test_malformed_packet_does_not_crash_the_server() {
        let port = free_port();
        let token = Token::generate();
        let logger = fresh_logger();
        let kill_switch = Arc::new(KillSwitch::start(logger.clone(), Arc::new(ExitPromise::new())));
        let exit = Arc::new(ExitPromise::new());
        let beam = test_beam();

        let server = ControlServer::start(
            port,
            token,
            logger,
            kill_switch.clone(),
            exit.clone(),
            beam,
        )
        .unwrap();

        let client = ClientSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(b"not an osc packet", SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(!exit.is_delivered());
        server.shutdown();
        kill_switch.deactivate();
    }
}
