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

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use log::debug;
use mutator_error::Error;
use tokio_util::sync::CancellationToken;

const UPDATE_MAX_RETRIES: u32 = 5;

/// Applies `mutate` to a freshly fetched copy of the named node and writes
/// it back, refetching and retrying on write conflicts up to a fixed bound.
///
/// Mutation closures must be idempotent: on a conflict they are re-applied
/// to the refetched node. The cancellation token interrupts the retry loop
/// between attempts; it is fired only on leadership loss, so a graceful
/// stop lets an in-flight update run to completion.
pub async fn update_node_retry<F>(
    nodes: &Api<Node>,
    name: &str,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<Node, Error>
where
    F: FnMut(&mut Node),
{
    for attempt in 1..=UPDATE_MAX_RETRIES {
        if cancel.is_cancelled() {
            return Err(Error::Canceled { node: name.to_string() });
        }
        let mut node = nodes.get(name).await?;
        mutate(&mut node);
        match nodes.replace(name, &PostParams::default(), &node).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(
                    "conflict updating node {}, retrying ({}/{})",
                    name, attempt, UPDATE_MAX_RETRIES
                );
            }
            Err(err) => return Err(Error::KubeClient { source: err }),
        }
    }
    Err(Error::RetriesExhausted { node: name.to_string() })
}

pub mod mutator_error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeClient {
            #[from]
            source: kube::Error,
        },

        #[error("updating node {node} exhausted conflict retries")]
        RetriesExhausted { node: String },

        #[error("update of node {node} canceled")]
        Canceled { node: String },
    }
}
