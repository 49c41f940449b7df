//! Composition root: one [`Configuration`] and one [`Sandbox`] shared by every bot.

use std::thread;

use tracing::{info, instrument, trace};

use crate::{
    bot::LaunchDescriptor,
    configuration::Configuration,
    logger::init_logger,
    sandbox::{CgroupBackend, RlimitBackend, Sandbox, SandboxPolicy},
    supervisor::{BotStatus, BotSupervisor},
};

/// Launches bots under the configured sandbox.
#[derive(Debug)]
pub struct Engine {
    config: Configuration,
    sandbox: Sandbox,
}

impl Engine {
    /// Create an [`Engine`] with the default sandbox: resource limits, plus one cgroup per
    /// bot when enabled in `config`.
    ///
    /// # Errors
    ///
    /// Fails if logging is enabled and the engine log cannot be installed.
    #[instrument(skip_all)]
    pub fn new(config: Configuration) -> anyhow::Result<Engine> {
        if config.log {
            let path = init_logger(config.log_dir())?;
            info!(path = %path.display(), "engine log installed");
        }
        trace!(?config);

        let mut sandbox = Sandbox::new(config.allow_uncontained).with_backend(RlimitBackend);
        if config.use_cgroups {
            sandbox = sandbox.with_backend(CgroupBackend::new());
        }
        Ok(Engine { config, sandbox })
    }

    /// Replace the sandbox, e.g. to register a platform backend.
    #[must_use]
    pub fn with_sandbox(self, sandbox: Sandbox) -> Engine {
        Engine { sandbox, ..self }
    }

    /// Engine configuration.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Sandbox applied to every bot.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Start one bot and wait for its handshake.
    pub fn launch(&self, launch: LaunchDescriptor, policy: &SandboxPolicy) -> BotSupervisor {
        BotSupervisor::spawn(launch, policy.clone(), &self.sandbox, &self.config)
    }

    /// Start every bot, handshakes running concurrently. Supervisors come back in the order
    /// of `launches`.
    #[instrument(skip_all, fields(bots = launches.len()))]
    pub fn launch_all(
        &self,
        launches: Vec<LaunchDescriptor>,
        policy: &SandboxPolicy,
    ) -> Vec<BotSupervisor> {
        let bots: Vec<BotSupervisor> = thread::scope(|scope| {
            let handles: Vec<_> = launches
                .into_iter()
                .map(|launch| scope.spawn(move || self.launch(launch, policy)))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(bot) => bot,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });
        let active = bots
            .iter()
            .filter(|bot| bot.status() == BotStatus::Active)
            .count();
        info!(active, total = bots.len(), "bots launched");
        bots
    }
}
