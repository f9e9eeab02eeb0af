/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2023. All rights reserved.
 * reboot-operator is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use std::future::Future;

use kube::Client;
use log::{debug, error};
use operator_error::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::controller::RebootController;
use super::leadership::LeaderElector;
use super::values::{
    DEFAULT_LEADER_ELECTION_LEASE, DEFAULT_MAX_REBOOTING_NODES, DEFAULT_RECONCILIATION_PERIOD,
    LEADER_ELECTION_RESOURCE_NAME, LOCK_TYPE_LEASES,
};
use super::window::RebootWindow;

/// Configures an Operator.
pub struct Config {
    /// Kubernetes client.
    pub client: Client,
    /// Namespace for the leader-election resource and events.
    pub namespace: String,
    /// Identity of this instance in the lease.
    pub lock_id: String,
    /// Lease resource kind; only the lease object is supported.
    pub lock_type: String,
    /// Annotations to look for before and after reboots.
    pub before_reboot_annotations: Vec<String>,
    pub after_reboot_annotations: Vec<String>,
    /// Reboot window; both empty means always open.
    pub reboot_window_start: String,
    pub reboot_window_length: String,
    pub reconciliation_period: Duration,
    pub leader_election_lease: Duration,
    pub max_rebooting_nodes: usize,
}

impl Config {
    pub fn new(client: Client, namespace: &str, lock_id: &str) -> Self {
        Config {
            client,
            namespace: namespace.to_string(),
            lock_id: lock_id.to_string(),
            lock_type: String::new(),
            before_reboot_annotations: Vec::new(),
            after_reboot_annotations: Vec::new(),
            reboot_window_start: String::new(),
            reboot_window_length: String::new(),
            reconciliation_period: Duration::ZERO,
            leader_election_lease: Duration::ZERO,
            max_rebooting_nodes: 0,
        }
    }
}

/// Wires the reconciliation engine into a leader election and drives it at
/// the configured period while the lease is held.
pub struct Operator {
    engine: RebootController,
    elector: LeaderElector,
    reconciliation_period: Duration,
    // Fired only on leadership loss; observed by the mutator's retry loop.
    hard_cancel: CancellationToken,
    // Child of hard_cancel; asks the loops to exit without interrupting
    // in-flight node updates.
    shutdown: CancellationToken,
}

impl Operator {
    pub fn new(config: Config) -> Result<Self, Error> {
        check_config(&config)?;

        let reboot_window = match (
            config.reboot_window_start.is_empty(),
            config.reboot_window_length.is_empty(),
        ) {
            (true, true) => None,
            (false, false) => Some(RebootWindow::parse(
                &config.reboot_window_start,
                &config.reboot_window_length,
            )?),
            _ => {
                return Err(Error::InvalidConfig {
                    reason: "reboot window start and length must be set together".to_string(),
                })
            }
        };

        let reconciliation_period = if config.reconciliation_period.is_zero() {
            DEFAULT_RECONCILIATION_PERIOD
        } else {
            config.reconciliation_period
        };
        let leader_election_lease = if config.leader_election_lease.is_zero() {
            DEFAULT_LEADER_ELECTION_LEASE
        } else {
            config.leader_election_lease
        };
        let max_rebooting_nodes = if config.max_rebooting_nodes == 0 {
            DEFAULT_MAX_REBOOTING_NODES
        } else {
            config.max_rebooting_nodes
        };

        let hard_cancel = CancellationToken::new();
        let shutdown = hard_cancel.child_token();
        let engine = RebootController::new(
            config.client.clone(),
            config.before_reboot_annotations,
            config.after_reboot_annotations,
            reboot_window,
            max_rebooting_nodes,
            hard_cancel.clone(),
        );
        let elector = LeaderElector::new(
            config.client,
            &config.namespace,
            LEADER_ELECTION_RESOURCE_NAME,
            &config.lock_id,
            leader_election_lease,
        );

        Ok(Operator { engine, elector, reconciliation_period, hard_cancel, shutdown })
    }

    /// Runs the operator until the stop future resolves or leadership is
    /// lost. The reconciliation ticker only starts once the lease is
    /// acquired; ticks are strictly sequential. A stop is graceful: the
    /// current tick, including any in-flight node update retry, runs to
    /// completion and the lease is released afterwards. Leadership loss
    /// hard-cancels the engine instead.
    pub async fn run<S>(self, stop: S) -> Result<(), Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let Operator { engine, elector, reconciliation_period, hard_cancel, shutdown } = self;

        // Terminal outcome of the runner; the first writer wins.
        let (error_tx, mut error_rx) = mpsc::channel::<Result<(), Error>>(1);

        let stop_error_tx = error_tx.clone();
        let stop_token = shutdown.clone();
        tokio::spawn(async move {
            stop.await;
            let _ = stop_error_tx.try_send(Ok(()));
            stop_token.cancel();
        });

        let (leading_tx, leading_rx) = oneshot::channel();
        // The elector holds the lease until the ticker has fully exited,
        // so a graceful stop does not hand the lease over mid-tick.
        let elector_stop = CancellationToken::new();
        let elector_task = tokio::spawn({
            let elector_stop = elector_stop.clone();
            let hard_cancel = hard_cancel.clone();
            async move {
                if let Err(err) = elector.run(&elector_stop, leading_tx).await {
                    let _ = error_tx.try_send(Err(err.into()));
                    // Leadership loss propagates into the mutator's retry
                    // loop through the hard cancel.
                    hard_cancel.cancel();
                }
            }
        });

        debug!("starting controller");

        tokio::select! {
            _ = shutdown.cancelled() => {}
            leading = leading_rx => {
                if leading.is_ok() {
                    let mut ticker = interval(reconciliation_period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                if let Err(err) = engine.process().await {
                                    error!("reconciliation failed: {}", err);
                                }
                            }
                        }
                    }
                }
            }
        }

        debug!("stopping controller");

        elector_stop.cancel();
        let _ = elector_task.await;

        error_rx.recv().await.unwrap_or(Ok(()))
    }
}

fn check_config(config: &Config) -> Result<(), Error> {
    if config.namespace.is_empty() {
        return Err(Error::InvalidConfig { reason: "namespace must not be empty".to_string() });
    }
    if config.lock_id.is_empty() {
        return Err(Error::InvalidConfig { reason: "lockID must not be empty".to_string() });
    }
    if !config.lock_type.is_empty() && config.lock_type != LOCK_TYPE_LEASES {
        return Err(Error::InvalidConfig {
            reason: format!("unsupported lock type {:?}", config.lock_type),
        });
    }
    Ok(())
}

pub mod operator_error {
    use thiserror::Error;

    use crate::controller::leadership::leadership_error;
    use crate::controller::window::window_error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("invalid configuration: {reason}")]
        InvalidConfig { reason: String },

        #[error("parsing reboot window: {source}")]
        RebootWindow {
            #[from]
            source: window_error::Error,
        },

        #[error("leaderelection lost")]
        LeadershipLost,
    }

    impl From<leadership_error::Error> for Error {
        fn from(err: leadership_error::Error) -> Self {
            match err {
                leadership_error::Error::LeadershipLost => Error::LeadershipLost,
            }
        }
    }
}
