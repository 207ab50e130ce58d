//! End-to-end update runs against a simulated NINA module.

use {
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Mutex},
        time::Duration,
    },
    ubxflash::{
        CancelToken, ErrorKind, FirmwareDescriptor, Port, PortOpener, SerialConfig, UpdateEvent,
        UpdateOptions, UpdateStage, UpdateTimeouts, Updater, XmodemConfig,
        protocol::{crc::crc16_xmodem, xmodem::control},
    },
};

const SOH_FRAME_LEN: usize = 3 + 128 + 2;

/// What the host observed the module doing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Trace {
    Open(u32),
    Close,
    Command(String),
}

enum Mode {
    Command,
    Xmodem,
}

/// Module firmware model: AT command interpreter plus XMODEM receiver.
struct Module {
    baud: u32,
    pending_baud: Option<u32>,
    link_baud: u32,
    version: String,
    flashed_version: String,
    mode: Mode,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    trace: Vec<Trace>,
    image: Vec<u8>,
    expected_seq: u8,
    /// NAKs still to send per block index (0-based).
    naks: HashMap<usize, usize>,
    blocks_received: usize,
    ready_burst: Vec<u8>,
    reject_prefix: Option<String>,
    silent: bool,
    cancelled: bool,
}

impl Module {
    fn new(version: &str, flashed_version: &str) -> Self {
        Self {
            baud: 115_200,
            pending_baud: None,
            link_baud: 0,
            version: version.into(),
            flashed_version: flashed_version.into(),
            mode: Mode::Command,
            rx: Vec::new(),
            tx: VecDeque::new(),
            trace: Vec::new(),
            image: Vec::new(),
            expected_seq: 1,
            naks: HashMap::new(),
            blocks_received: 0,
            ready_burst: b"CCC".to_vec(),
            reject_prefix: None,
            silent: false,
            cancelled: false,
        }
    }

    fn reply(&mut self, text: &str) {
        self.tx
            .extend(text.bytes());
    }

    fn receive(&mut self, bytes: &[u8]) {
        // Nothing intelligible arrives when the two sides disagree on the rate
        if self.link_baud != self.baud {
            return;
        }
        self.rx
            .extend_from_slice(bytes);
        match self.mode {
            Mode::Command => self.process_commands(),
            Mode::Xmodem => self.process_frames(),
        }
    }

    fn process_commands(&mut self) {
        while let Some(pos) = self
            .rx
            .iter()
            .position(|&b| b == b'\r')
        {
            let line: Vec<u8> = self
                .rx
                .drain(..=pos)
                .collect();
            let command = String::from_utf8_lossy(&line[..pos])
                .trim()
                .to_string();
            self.trace
                .push(Trace::Command(command.clone()));
            self.execute(&command);
        }
    }

    fn execute(&mut self, command: &str) {
        if self.silent {
            return;
        }
        if self
            .reject_prefix
            .as_deref()
            .is_some_and(|prefix| command.starts_with(prefix))
        {
            self.reply("\r\nERROR\r\n");
            return;
        }

        if command == "ATI9" {
            let version = self
                .version
                .clone();
            self.reply(&format!("\r\n\"{version}\"\r\nOK\r\n"));
        } else if let Some(args) = command.strip_prefix("AT+UMRS=") {
            self.pending_baud = args
                .split(',')
                .next()
                .and_then(|b| b.parse().ok());
            self.reply("\r\nOK\r\n");
        } else if command == "AT+CPWROFF" {
            self.reply("\r\nOK\r\n");
            if let Some(baud) = self
                .pending_baud
                .take()
            {
                self.baud = baud;
            }
        } else if command.starts_with("AT+UFWUPD=") {
            self.mode = Mode::Xmodem;
            self.expected_seq = 1;
            let burst = self
                .ready_burst
                .clone();
            self.tx
                .extend(burst);
        } else if command == "AT" {
            self.reply("\r\nOK\r\n");
        } else {
            self.reply("\r\nERROR\r\n");
        }
    }

    fn process_frames(&mut self) {
        loop {
            match self
                .rx
                .first()
                .copied()
            {
                Some(control::EOT) => {
                    self.rx
                        .remove(0);
                    self.tx
                        .push_back(control::ACK);
                    self.mode = Mode::Command;
                    self.version = self
                        .flashed_version
                        .clone();
                    self.reply("\r\n+STARTUP\r\n");
                },
                Some(control::CAN) => {
                    self.rx
                        .clear();
                    self.cancelled = true;
                    self.mode = Mode::Command;
                    return;
                },
                Some(control::SOH) if self.rx.len() >= SOH_FRAME_LEN => {
                    let frame: Vec<u8> = self
                        .rx
                        .drain(..SOH_FRAME_LEN)
                        .collect();
                    self.accept_frame(&frame);
                },
                _ => return,
            }
        }
    }

    fn accept_frame(&mut self, frame: &[u8]) {
        let seq = frame[1];
        let payload = &frame[3..131];
        let crc = u16::from_be_bytes([frame[131], frame[132]]);
        let index = self.blocks_received;

        let valid = seq == self.expected_seq && frame[2] == !seq && crc == crc16_xmodem(payload);
        let nak = self
            .naks
            .get_mut(&index)
            .filter(|left| **left > 0);
        if let Some(left) = nak {
            *left -= 1;
            self.tx
                .push_back(control::NAK);
            return;
        }
        if !valid {
            self.tx
                .push_back(control::NAK);
            return;
        }

        self.image
            .extend_from_slice(payload);
        self.blocks_received += 1;
        self.expected_seq = self
            .expected_seq
            .wrapping_add(1);
        self.tx
            .push_back(control::ACK);
    }
}

type Shared = Arc<Mutex<Module>>;

struct SimPort {
    module: Shared,
    timeout: Duration,
    closed: bool,
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        let mut module = self
            .module
            .lock()
            .unwrap();
        let mut n = 0;
        while n < buf.len() {
            match module
                .tx
                .pop_front()
            {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                },
                None => break,
            }
        }
        if n == 0 {
            Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
        } else {
            Ok(n)
        }
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        self.module
            .lock()
            .unwrap()
            .receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, timeout: Duration) -> ubxflash::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> ubxflash::Result<()> {
        self.module
            .lock()
            .unwrap()
            .tx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn close(&mut self) -> ubxflash::Result<()> {
        if !self.closed {
            self.closed = true;
            self.module
                .lock()
                .unwrap()
                .trace
                .push(Trace::Close);
        }
        Ok(())
    }
}

struct SimOpener {
    module: Shared,
}

impl PortOpener for SimOpener {
    type Port = SimPort;

    fn open(&mut self, config: &SerialConfig) -> ubxflash::Result<SimPort> {
        let mut module = self
            .module
            .lock()
            .unwrap();
        module
            .trace
            .push(Trace::Open(config.baud_rate));
        module.link_baud = config.baud_rate;
        Ok(SimPort {
            module: Arc::clone(&self.module),
            timeout: config.timeout,
            closed: false,
        })
    }
}

fn options() -> UpdateOptions {
    UpdateOptions::new("sim")
        .with_timeouts(UpdateTimeouts {
            response: Duration::from_millis(200),
            readiness: Duration::from_millis(500),
            restart: Duration::from_millis(500),
            reboot_delay: Duration::ZERO,
        })
        .with_xmodem(XmodemConfig {
            ack_timeout: Duration::from_millis(50),
            ..XmodemConfig::default()
        })
}

fn firmware(len: usize, version: &str) -> FirmwareDescriptor {
    let image = (0..len)
        .map(|i| (i % 251) as u8)
        .collect();
    FirmwareDescriptor::new(0x1F, image, "5A5A", "0", version)
}

fn updater(module: &Shared, options: UpdateOptions) -> Updater<SimOpener> {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    Updater::new(
        SimOpener {
            module: Arc::clone(module),
        },
        options,
    )
}

fn shared(module: Module) -> Shared {
    Arc::new(Mutex::new(module))
}

fn commands(module: &Shared) -> Vec<String> {
    module
        .lock()
        .unwrap()
        .trace
        .iter()
        .filter_map(|t| match t {
            Trace::Command(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn update_4096_byte_image_sends_32_blocks() {
    let module = shared(Module::new("2.1.0-002", "3.1.0-041"));
    let fw = firmware(4096, "3.1.0-041").with_baud_rates(115_200, 115_200);
    let mut progress = Vec::new();

    let report = updater(&module, options())
        .run(&fw, |event| {
            if let UpdateEvent::Transfer(p) = event {
                progress.push(p.bytes_acked);
            }
        })
        .unwrap();

    assert_eq!(report.transfer.blocks, 32);
    assert_eq!(report.transfer.bytes, 4096);
    assert_eq!(progress.len(), 32);
    assert_eq!(progress.last(), Some(&4096));
    assert_eq!(report.pre_version, "2.1.0-002");
    assert_eq!(report.post_version, "3.1.0-041");
    assert!(report.version_changed());

    let module = module
        .lock()
        .unwrap();
    assert_eq!(module.blocks_received, 32);
    assert_eq!(module.image, fw.image);
}

#[test]
fn partial_last_block_is_padded_and_counted_exactly() {
    let module = shared(Module::new("2.1.0", "3.1.0"));
    let fw = firmware(1000, "3.1.0").with_baud_rates(115_200, 115_200);
    let mut last = None;

    let report = updater(&module, options())
        .run(&fw, |event| {
            if let UpdateEvent::Transfer(p) = event {
                last = Some(p);
            }
        })
        .unwrap();

    assert_eq!(report.transfer.blocks, 8);
    assert_eq!(report.transfer.bytes, 1000);
    let last = last.unwrap();
    assert_eq!(last.bytes_acked, 1000);
    assert_eq!(last.total_bytes, 1000);

    let module = module
        .lock()
        .unwrap();
    assert_eq!(module.image.len(), 1024);
    assert_eq!(&module.image[..1000], &fw.image[..]);
    assert!(module.image[1000..].iter().all(|&b| b == 0));
}

#[test]
fn equal_rates_send_no_renegotiation_commands() {
    let module = shared(Module::new("2.1.0", "3.1.0"));
    let fw = firmware(256, "3.1.0").with_baud_rates(115_200, 115_200);

    let report = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap();

    assert!(!report.renegotiated);
    assert!(!report.baud_restored);
    assert_eq!(
        commands(&module),
        vec![
            "ATI9".to_string(),
            "AT+UFWUPD=0,115200,31,256,5A5A,3.1.0,0".to_string(),
            "ATI9".to_string(),
        ]
    );
    assert_eq!(
        module
            .lock()
            .unwrap()
            .trace
            .iter()
            .filter(|t| matches!(t, Trace::Open(_)))
            .count(),
        1
    );
}

#[test]
fn differing_rates_renegotiate_in_order() {
    let module = shared(Module::new("2.1.0", "3.1.0"));
    let fw = firmware(256, "3.1.0");

    let report = updater(&module, options().with_restore_operating_baud(false))
        .run(&fw, |_| {})
        .unwrap();

    assert!(report.renegotiated);
    assert!(!report.baud_restored);
    assert_eq!(report.final_baud, 921_600);
    assert_eq!(
        module
            .lock()
            .unwrap()
            .trace,
        vec![
            Trace::Open(115_200),
            Trace::Command("ATI9".into()),
            Trace::Command("AT+UMRS=921600,1,8,1,1,0".into()),
            Trace::Command("AT+CPWROFF".into()),
            Trace::Close,
            Trace::Open(921_600),
            Trace::Command("AT".into()),
            Trace::Command("AT+UFWUPD=0,921600,31,256,5A5A,3.1.0,0".into()),
            Trace::Command("ATI9".into()),
            Trace::Close,
        ]
    );
}

#[test]
fn restore_switches_both_sides_back_after_upgrade() {
    let module = shared(Module::new("2.1.0", "3.1.0"));
    let fw = firmware(256, "3.1.0");
    let mut stages = Vec::new();

    let report = updater(&module, options())
        .run(&fw, |event| {
            if let UpdateEvent::Stage(stage) = event {
                stages.push(stage);
            }
        })
        .unwrap();

    assert!(report.baud_restored);
    assert_eq!(report.final_baud, 115_200);
    assert_eq!(
        module
            .lock()
            .unwrap()
            .baud,
        115_200
    );
    assert_eq!(
        stages,
        vec![
            UpdateStage::Connect,
            UpdateStage::QueryPreVersion,
            UpdateStage::Renegotiate,
            UpdateStage::UpdateCommand,
            UpdateStage::Transfer,
            UpdateStage::AwaitRestart,
            UpdateStage::QueryPostVersion,
            UpdateStage::RestoreBaudRate,
            UpdateStage::Done,
        ]
    );
    let umrs: Vec<_> = commands(&module)
        .into_iter()
        .filter(|c| c.starts_with("AT+UMRS"))
        .collect();
    assert_eq!(
        umrs,
        vec!["AT+UMRS=921600,1,8,1,1,0", "AT+UMRS=115200,1,8,1,1,0"]
    );
}

#[test]
fn same_version_reflash_skips_restore() {
    let module = shared(Module::new("3.1.0-041", "3.1.0-041"));
    let fw = firmware(256, "3.1.0-041");

    let report = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap();

    assert!(report.renegotiated);
    assert!(!report.baud_restored);
    assert_eq!(report.final_baud, 921_600);
    assert_eq!(
        commands(&module)
            .iter()
            .filter(|c| c.starts_with("AT+UMRS"))
            .count(),
        1
    );
}

#[test]
fn repeated_update_on_target_version_completes_twice() {
    let module = shared(Module::new("3.1.0", "3.1.0"));
    let fw = firmware(512, "3.1.0").with_baud_rates(115_200, 115_200);

    for _ in 0..2 {
        let report = updater(&module, options())
            .run(&fw, |_| {})
            .unwrap();
        assert_eq!(report.pre_version, report.post_version);
        assert!(!report.baud_restored);
    }
    assert!(
        !commands(&module)
            .iter()
            .any(|c| c.starts_with("AT+UMRS"))
    );
}

#[test]
fn noisy_readiness_marker_still_starts_transfer() {
    let mut sim = Module::new("2.1.0", "3.1.0");
    sim.ready_burst = b"CXCCC".to_vec();
    let module = shared(sim);
    let fw = firmware(128, "3.1.0").with_baud_rates(115_200, 115_200);

    let report = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap();
    assert_eq!(report.transfer.blocks, 1);
}

#[test]
fn broken_readiness_marker_times_out() {
    let mut sim = Module::new("2.1.0", "3.1.0");
    sim.ready_burst = b"CCXCC".to_vec();
    let module = shared(sim);
    let fw = firmware(128, "3.1.0").with_baud_rates(115_200, 115_200);

    let err = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.stage(), Some(UpdateStage::UpdateCommand));
}

#[test]
fn nak_up_to_retry_ceiling_succeeds() {
    let mut sim = Module::new("2.1.0", "3.1.0");
    sim.naks
        .insert(1, 10);
    let module = shared(sim);
    let fw = firmware(384, "3.1.0").with_baud_rates(115_200, 115_200);

    let report = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap();
    assert_eq!(report.transfer.blocks, 3);
    assert_eq!(report.transfer.retransmissions, 10);
}

#[test]
fn nak_beyond_retry_ceiling_aborts_transfer() {
    let mut sim = Module::new("2.1.0", "3.1.0");
    sim.naks
        .insert(1, 11);
    let module = shared(sim);
    let fw = firmware(384, "3.1.0").with_baud_rates(115_200, 115_200);

    let err = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.stage(), Some(UpdateStage::Transfer));

    let module = module
        .lock()
        .unwrap();
    assert!(module.cancelled);
    assert_eq!(module.blocks_received, 1);
    assert_eq!(module.trace.last(), Some(&Trace::Close));
}

#[test]
fn error_reply_is_device_error_with_stage() {
    let mut sim = Module::new("2.1.0", "3.1.0");
    sim.reject_prefix = Some("AT+UMRS".into());
    let module = shared(sim);
    let fw = firmware(128, "3.1.0");

    let err = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(err.stage(), Some(UpdateStage::Renegotiate));
    assert!(err.to_string().contains("AT+UMRS"));
    assert_eq!(
        module
            .lock()
            .unwrap()
            .trace
            .last(),
        Some(&Trace::Close)
    );
}

#[test]
fn silent_module_is_timeout_not_device_error() {
    let mut sim = Module::new("2.1.0", "3.1.0");
    sim.silent = true;
    let module = shared(sim);
    let fw = firmware(128, "3.1.0");

    let err = updater(&module, options())
        .run(&fw, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.stage(), Some(UpdateStage::QueryPreVersion));
    assert_eq!(
        module
            .lock()
            .unwrap()
            .trace
            .last(),
        Some(&Trace::Close)
    );
}

#[test]
fn cancelled_run_stops_before_any_command() {
    let module = shared(Module::new("2.1.0", "3.1.0"));
    let fw = firmware(128, "3.1.0");
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = updater(&module, options())
        .with_cancel(cancel)
        .run(&fw, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.stage(), Some(UpdateStage::Connect));
    assert!(commands(&module).is_empty());
}

#[test]
fn query_version_reads_quoted_version() {
    let module = shared(Module::new("3.1.0-041", "3.1.0-041"));

    let version = ubxflash::query_firmware_version(
        SimOpener {
            module: Arc::clone(&module),
        },
        options(),
    )
    .unwrap();
    assert_eq!(version, "3.1.0-041");
    assert_eq!(commands(&module), vec!["ATI9".to_string()]);
}
