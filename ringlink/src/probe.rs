use crate::config::UringConfig;
use crate::errors::UringError;
use io_uring::{IoUring, Probe, opcode};

/// Proof that io_uring is usable on this host with the given configuration.
///
/// Every io_uring backed connection is constructed from a `Uring`, so there
/// is no way to build one without a successful probe.
#[derive(Debug, Clone)]
pub struct Uring {
    config: UringConfig,
}

impl Uring {
    pub fn probe(config: UringConfig) -> Result<Self, UringError> {
        if !config.enabled() {
            return Err(UringError::Unavailable {
                reason: "disabled by configuration",
            });
        }

        check_kernel()?;
        tracing::debug!(?config, "io_uring available");

        Ok(Self { config })
    }

    pub fn config(&self) -> &UringConfig {
        &self.config
    }
}

/// Whether [`Uring::probe`] would succeed.
pub fn is_available(config: &UringConfig) -> bool {
    match Uring::probe(config.clone()) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "io_uring probe failed");
            false
        }
    }
}

const REQUIRED: [(u8, &str); 5] = [
    (opcode::RecvMsg::CODE, "IORING_OP_RECVMSG"),
    (opcode::SendMsg::CODE, "IORING_OP_SENDMSG"),
    (opcode::Readv::CODE, "IORING_OP_READV"),
    (opcode::Writev::CODE, "IORING_OP_WRITEV"),
    (opcode::AsyncCancel::CODE, "IORING_OP_ASYNC_CANCEL"),
];

fn check_kernel() -> Result<(), UringError> {
    let ring = IoUring::new(2).map_err(|e| {
        tracing::debug!(error = %e, "cannot create io_uring");
        UringError::Unavailable {
            reason: "io_uring_setup failed",
        }
    })?;

    // Bounded teardown waits through IORING_ENTER_EXT_ARG.
    if !ring.params().is_feature_ext_arg() {
        return Err(UringError::Unavailable {
            reason: "IORING_FEAT_EXT_ARG not supported",
        });
    }

    let mut probe = Probe::new();
    ring.submitter()
        .register_probe(&mut probe)
        .map_err(|_| UringError::Unavailable {
            reason: "IORING_REGISTER_PROBE failed",
        })?;

    for (code, name) in REQUIRED {
        if !probe.is_supported(code) {
            tracing::debug!(opcode = name, "opcode not supported");
            return Err(UringError::Unavailable {
                reason: "required opcode not supported",
            });
        }
    }

    Ok(())
}
