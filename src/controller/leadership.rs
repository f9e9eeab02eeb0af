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

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client,
};
use leadership_error::Error;
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::values::LEADER_ELECTION_SOURCE_COMPONENT;

/// Contends for a named lease so that only one operator instance mutates
/// nodes at a time. Lease parameters are derived from a single lease
/// duration: the renew deadline is two thirds of it and the retry period
/// one third.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    event_api: Api<Event>,
    namespace: String,
    lock_name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

enum RenewError {
    // The lease is held by a foreign identity.
    Lost,
    Transient(kube::Error),
}

impl LeaderElector {
    pub fn new(
        client: Client,
        namespace: &str,
        lock_name: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Self {
        LeaderElector {
            lease_api: Api::namespaced(client.clone(), namespace),
            event_api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            lock_name: lock_name.to_string(),
            identity: identity.to_string(),
            lease_duration,
            renew_deadline: lease_duration * 2 / 3,
            retry_period: lease_duration / 3,
        }
    }

    /// Contends for the lease until it is acquired, signals `on_leading`,
    /// then keeps renewing. Returns Ok once stopped (releasing the lease
    /// if held) and an error once an acquired lease is lost.
    pub async fn run(
        &self,
        stop: &CancellationToken,
        on_leading: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!("lease {} is held by another instance; retrying", self.lock_name)
                }
                Err(err) => warn!("acquiring lease {}: {}", self.lock_name, err),
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = sleep(self.retry_period) => {}
            }
        }

        info!("started leading with identity {:?}", self.identity);
        self.publish_event("LeaderElection", &format!("{} became leader", self.identity)).await;
        let _ = on_leading.send(());

        let mut last_renew = Instant::now();
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    self.release().await;
                    return Ok(());
                }
                _ = sleep(self.retry_period) => {}
            }
            match self.renew().await {
                Ok(()) => last_renew = Instant::now(),
                Err(RenewError::Lost) => {
                    warn!("lease {} was taken over by another instance", self.lock_name);
                    self.publish_event(
                        "LeaderLost",
                        &format!("{} lost the lease", self.identity),
                    )
                    .await;
                    return Err(Error::LeadershipLost);
                }
                Err(RenewError::Transient(err)) => {
                    warn!("renewing lease {}: {}", self.lock_name, err);
                    if last_renew.elapsed() > self.renew_deadline {
                        self.publish_event(
                            "LeaderLost",
                            &format!("{} failed to renew the lease in time", self.identity),
                        )
                        .await;
                        return Err(Error::LeadershipLost);
                    }
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        match self.lease_api.get(&self.lock_name).await {
            Ok(lease) => self.take_over(lease).await,
            Err(kube::Error::Api(response)) if response.code == 404 => self.create().await,
            Err(err) => Err(err),
        }
    }

    async fn create(&self) -> Result<bool, kube::Error> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lock_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Another instance created the lease first.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn take_over(&self, mut lease: Lease) -> Result<bool, kube::Error> {
        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();
        if !holder.is_empty() && holder != self.identity && !lease_expired(&spec, self.lease_duration)
        {
            return Ok(false);
        }

        let now = MicroTime(Utc::now());
        let transitions = spec.lease_transitions.unwrap_or(0);
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(if holder == self.identity {
                transitions
            } else {
                transitions + 1
            }),
        });
        match self.lease_api.replace(&self.lock_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Lost the race against another instance.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn renew(&self) -> Result<(), RenewError> {
        let mut lease =
            self.lease_api.get(&self.lock_name).await.map_err(RenewError::Transient)?;
        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Err(RenewError::Lost);
        }
        lease.spec = Some(LeaseSpec { renew_time: Some(MicroTime(Utc::now())), ..spec });
        match self.lease_api.replace(&self.lock_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(()),
            // A conflicting write is resolved by the next renewal cycle.
            Err(err) => Err(RenewError::Transient(err)),
        }
    }

    // Clears the holder identity so a follower can take over without
    // waiting for the lease to expire. Best effort.
    async fn release(&self) {
        let result = async {
            let mut lease = self.lease_api.get(&self.lock_name).await?;
            if let Some(spec) = lease.spec.as_mut() {
                if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
                    return Ok(());
                }
                spec.holder_identity = Some(String::new());
            }
            self.lease_api.replace(&self.lock_name, &PostParams::default(), &lease).await?;
            Ok::<(), kube::Error>(())
        }
        .await;
        if let Err(err) = result {
            warn!("releasing lease {}: {}", self.lock_name, err);
        }
        info!("stopped leading");
        self.publish_event("LeaderElection", &format!("{} stopped leading", self.identity))
            .await;
    }

    // Leadership transitions are surfaced as events on the lease object.
    // Failures to publish are never fatal.
    async fn publish_event(&self, reason: &str, message: &str) {
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{:x}", self.lock_name, now.timestamp_millis())),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("coordination.k8s.io/v1".to_string()),
                kind: Some("Lease".to_string()),
                name: Some(self.lock_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Normal".to_string()),
            source: Some(EventSource {
                component: Some(LEADER_ELECTION_SOURCE_COMPONENT.to_string()),
                ..Default::default()
            }),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            count: Some(1),
            ..Default::default()
        };
        if let Err(err) = self.event_api.create(&PostParams::default(), &event).await {
            warn!("publishing {:?} event: {}", reason, err);
        }
    }
}

fn lease_expired(spec: &LeaseSpec, lease_duration: Duration) -> bool {
    match &spec.renew_time {
        // A renew time in the future converts to an error and counts as
        // not expired.
        Some(MicroTime(renewed)) => Utc::now()
            .signed_duration_since(*renewed)
            .to_std()
            .map(|age| age > lease_duration)
            .unwrap_or(false),
        None => true,
    }
}

pub mod leadership_error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("leaderelection lost")]
        LeadershipLost,
    }
}
