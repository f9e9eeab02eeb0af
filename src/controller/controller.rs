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

use chrono::Local;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams, ObjectList},
    Client, ResourceExt,
};
use log::{debug, info, warn};
use reconciler_error::Error;
use tokio_util::sync::CancellationToken;

use super::mutator::update_node_retry;
use super::predicates::{
    has_all_annotations, has_true_label, just_rebooted_selector, rebootable_selector,
    still_rebooting_selector, AnnotationSelector,
};
use super::values::{
    ANNOTATION_OK_TO_REBOOT, FALSE, LABEL_AFTER_REBOOT, LABEL_BEFORE_REBOOT, TRUE,
};
use super::window::RebootWindow;

/// The reconciliation engine. One `process` call drives every node one step
/// further through the reboot lifecycle by editing the operator-owned labels
/// and annotations; all state lives on the node objects themselves.
pub struct RebootController {
    k8s_client: Client,
    before_reboot_annotations: Vec<String>,
    after_reboot_annotations: Vec<String>,
    reboot_window: Option<RebootWindow>,
    max_rebooting_nodes: usize,
    rebootable: AnnotationSelector,
    just_rebooted: AnnotationSelector,
    still_rebooting: AnnotationSelector,
    cancel: CancellationToken,
}

// Parameters shared by the before- and after-reboot completion checks.
struct CheckRebootOptions<'a> {
    label: &'static str,
    annotations: &'a [String],
    ok_to_reboot: &'static str,
}

impl RebootController {
    pub fn new(
        k8s_client: Client,
        before_reboot_annotations: Vec<String>,
        after_reboot_annotations: Vec<String>,
        reboot_window: Option<RebootWindow>,
        max_rebooting_nodes: usize,
        cancel: CancellationToken,
    ) -> Self {
        RebootController {
            k8s_client,
            before_reboot_annotations,
            after_reboot_annotations,
            reboot_window,
            max_rebooting_nodes,
            rebootable: rebootable_selector(),
            just_rebooted: just_rebooted_selector(),
            still_rebooting: still_rebooting_selector(),
            cancel,
        }
    }

    fn nodes_api(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }

    async fn list_nodes(&self, params: &ListParams) -> Result<ObjectList<Node>, Error> {
        Ok(self.nodes_api().list(params).await?)
    }

    /// Runs one reconciliation tick. Every phase lists nodes afresh since
    /// state may have drifted; the first error aborts the tick and the next
    /// tick retries from the beginning.
    pub async fn process(&self) -> Result<(), Error> {
        debug!("going through a reconciliation cycle");

        debug!("cleaning up node state");
        self.cleanup_state().await?;

        debug!("checking if configured after-reboot annotations are set to true");
        self.check_after_reboot().await?;

        debug!("labelling rebooted nodes with after-reboot label");
        self.mark_after_reboot().await?;

        debug!("checking if configured before-reboot annotations are set to true");
        self.check_before_reboot().await?;

        debug!("labelling rebootable nodes with before-reboot label");
        self.mark_before_reboot().await?;

        Ok(())
    }

    // Nodes carrying the before-reboot label must still want to reboot;
    // a node which changed its mind gets the label and any hook progress
    // annotations removed so the next cycle starts from a clean slate.
    async fn cleanup_state(&self) -> Result<(), Error> {
        let node_list = self.list_nodes(&ListParams::default()).await?;

        for node in node_list
            .iter()
            .filter(|node| node.labels().contains_key(LABEL_BEFORE_REBOOT))
        {
            if self.rebootable.matches_node(node) {
                continue;
            }

            warn!(
                "node {} no longer wanted to reboot while we were trying to label it so: {:?}",
                node.name(),
                node.annotations()
            );

            let rebootable = self.rebootable.clone();
            let annotations = self.before_reboot_annotations.clone();
            update_node_retry(&self.nodes_api(), &node.name(), &self.cancel, move |node| {
                if !node.labels().contains_key(LABEL_BEFORE_REBOOT) {
                    return;
                }
                if rebootable.matches_node(node) {
                    return;
                }
                node.labels_mut().remove(LABEL_BEFORE_REBOOT);
                for annotation in &annotations {
                    node.annotations_mut().remove(annotation);
                }
            })
            .await?;
        }

        Ok(())
    }

    // Finds nodes carrying the given label and, once every given annotation
    // is set to true, removes the label and the annotations in one update
    // and flips ok-to-reboot to signal the agent.
    async fn check_reboot(&self, opt: CheckRebootOptions<'_>) -> Result<(), Error> {
        let node_list = self.list_nodes(&ListParams::default()).await?;

        for node in node_list.iter().filter(|node| has_true_label(node, opt.label)) {
            if !has_all_annotations(node, opt.annotations) {
                continue;
            }

            debug!("deleting label {:?} for {}", opt.label, node.name());
            debug!(
                "setting annotation {:?} to {:?} for {}",
                ANNOTATION_OK_TO_REBOOT,
                opt.ok_to_reboot,
                node.name()
            );

            let label = opt.label;
            let ok_to_reboot = opt.ok_to_reboot;
            let annotations = opt.annotations.to_vec();
            update_node_retry(&self.nodes_api(), &node.name(), &self.cancel, move |node| {
                node.labels_mut().remove(label);
                for annotation in &annotations {
                    node.annotations_mut().remove(annotation);
                }
                node.annotations_mut()
                    .insert(ANNOTATION_OK_TO_REBOOT.to_string(), ok_to_reboot.to_string());
            })
            .await?;
        }

        Ok(())
    }

    /// Releases nodes whose post-reboot validation has passed back to idle:
    /// deletes the after-reboot label and annotations and sets
    /// ok-to-reboot to false, telling the agent the reboot has completed.
    async fn check_after_reboot(&self) -> Result<(), Error> {
        self.check_reboot(CheckRebootOptions {
            label: LABEL_AFTER_REBOOT,
            annotations: &self.after_reboot_annotations,
            ok_to_reboot: FALSE,
        })
        .await
    }

    /// Authorizes nodes whose pre-reboot validation has passed: deletes the
    /// before-reboot label and annotations and sets ok-to-reboot to true,
    /// telling the agent it may drain and reboot.
    async fn check_before_reboot(&self) -> Result<(), Error> {
        self.check_reboot(CheckRebootOptions {
            label: LABEL_BEFORE_REBOOT,
            annotations: &self.before_reboot_annotations,
            ok_to_reboot: TRUE,
        })
        .await
    }

    // Nodes which just came back from a reboot get stale after-reboot
    // annotations removed and the after-reboot label set in one update, so
    // post-reboot hooks observe a fresh slate.
    async fn mark_after_reboot(&self) -> Result<(), Error> {
        // Filter out nodes already labelled server side.
        let params = ListParams::default().labels(&format!("{}!={}", LABEL_AFTER_REBOOT, TRUE));
        let node_list = self.list_nodes(&params).await?;

        let just_rebooted: Vec<&Node> = node_list
            .iter()
            .filter(|node| self.just_rebooted.matches_node(node))
            .collect();

        info!("found {} rebooted nodes", just_rebooted.len());

        for node in just_rebooted {
            self.mark(&node.name(), LABEL_AFTER_REBOOT, "after-reboot", &self.after_reboot_annotations)
                .await?;
        }

        Ok(())
    }

    // Schedules up to the remaining reboot capacity of rebootable nodes for
    // pre-reboot hooks, but only inside the reboot window.
    async fn mark_before_reboot(&self) -> Result<(), Error> {
        if !self.inside_reboot_window() {
            debug!("outside the reboot window; not labelling rebootable nodes for now");
            return Ok(());
        }

        let node_list = self.list_nodes(&ListParams::default()).await?;

        for name in self.rebootable_nodes(&node_list.items) {
            self.mark(&name, LABEL_BEFORE_REBOOT, "before-reboot", &self.before_reboot_annotations)
                .await?;
        }

        Ok(())
    }

    fn inside_reboot_window(&self) -> bool {
        match &self.reboot_window {
            // The most recent reboot window might still be open.
            Some(window) => window.inside(Local::now()),
            None => true,
        }
    }

    // Nodes running before- or after-reboot checks are still considered to
    // be rebooting here.
    fn remaining_rebooting_capacity(&self, nodes: &[Node]) -> usize {
        let rebooting: Vec<&Node> = nodes
            .iter()
            .filter(|node| {
                self.still_rebooting.matches_node(node)
                    || has_true_label(node, LABEL_BEFORE_REBOOT)
                    || has_true_label(node, LABEL_AFTER_REBOOT)
            })
            .collect();

        let remaining = self.max_rebooting_nodes.saturating_sub(rebooting.len());
        if remaining == 0 {
            for node in &rebooting {
                info!("found node {} still rebooting, waiting", node.name());
            }
            info!(
                "found {} (of max {}) rebooting nodes; waiting for completion",
                rebooting.len(),
                self.max_rebooting_nodes
            );
        }

        remaining
    }

    // Chooses rebootable nodes up to the remaining capacity, in list order.
    fn rebootable_nodes(&self, nodes: &[Node]) -> Vec<String> {
        let remaining = self.remaining_rebooting_capacity(nodes);

        let chosen: Vec<String> = nodes
            .iter()
            .filter(|node| {
                self.rebootable.matches_node(node) && !has_true_label(node, LABEL_BEFORE_REBOOT)
            })
            .take(remaining)
            .map(|node| node.name())
            .collect();

        info!("found {} nodes that need a reboot", chosen.len());

        chosen
    }

    // Removes any hook annotations left over from a previous cycle and sets
    // the given label to true in one update.
    async fn mark(
        &self,
        node_name: &str,
        label: &'static str,
        annotations_type: &str,
        annotations: &[String],
    ) -> Result<(), Error> {
        debug!("deleting annotations {:?} for {}", annotations, node_name);
        debug!("setting label {:?} to {:?} for node {}", label, TRUE, node_name);

        let to_delete = annotations.to_vec();
        update_node_retry(&self.nodes_api(), node_name, &self.cancel, move |node| {
            for annotation in &to_delete {
                node.annotations_mut().remove(annotation);
            }
            node.labels_mut().insert(label.to_string(), TRUE.to_string());
        })
        .await?;

        if !annotations.is_empty() {
            info!(
                "waiting for {} annotations on node {}: {:?}",
                annotations_type, node_name, annotations
            );
        }

        Ok(())
    }
}

pub mod reconciler_error {
    use thiserror::Error;

    use crate::controller::mutator::mutator_error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeClient {
            #[from]
            source: kube::Error,
        },

        #[error("updating node reported error: {source}")]
        UpdateNode {
            #[from]
            source: mutator_error::Error,
        },
    }
}
