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

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use super::values::{
    ANNOTATION_OK_TO_REBOOT, ANNOTATION_REBOOT_IN_PROGRESS, ANNOTATION_REBOOT_NEEDED,
    ANNOTATION_REBOOT_PAUSED, FALSE, TRUE,
};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    Equals,
    NotEquals,
}

#[derive(Clone, Debug)]
struct Requirement {
    key: &'static str,
    op: Op,
    value: &'static str,
}

impl Requirement {
    // A missing key never equals any value, so it satisfies NotEquals.
    fn matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        let actual = annotations.get(self.key).map(String::as_str);
        match self.op {
            Op::Equals => actual == Some(self.value),
            Op::NotEquals => actual != Some(self.value),
        }
    }
}

/// Conjunction of requirements over a node's annotation set.
#[derive(Clone, Debug)]
pub struct AnnotationSelector(Vec<Requirement>);

impl AnnotationSelector {
    pub fn matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|req| req.matches(annotations))
    }

    pub fn matches_node(&self, node: &Node) -> bool {
        self.matches(node.annotations())
    }
}

/// Annotation set expected on a node when the agent may reboot it.
///
/// The agent sets reboot-needed to true when it would like to reboot and
/// back to false when it starts up. A node with reboot-paused set to true
/// is never considered.
pub fn rebootable_selector() -> AnnotationSelector {
    AnnotationSelector(vec![
        Requirement { key: ANNOTATION_REBOOT_NEEDED, op: Op::Equals, value: TRUE },
        Requirement { key: ANNOTATION_REBOOT_PAUSED, op: Op::NotEquals, value: TRUE },
        Requirement { key: ANNOTATION_OK_TO_REBOOT, op: Op::NotEquals, value: TRUE },
        Requirement { key: ANNOTATION_REBOOT_IN_PROGRESS, op: Op::NotEquals, value: TRUE },
    ])
}

/// Annotation set expected on a node after it has completed a reboot.
///
/// The operator sets ok-to-reboot to true to trigger the reboot, and the
/// agent sets reboot-needed and reboot-in-progress back to false once it
/// has finished.
pub fn just_rebooted_selector() -> AnnotationSelector {
    AnnotationSelector(vec![
        Requirement { key: ANNOTATION_OK_TO_REBOOT, op: Op::Equals, value: TRUE },
        Requirement { key: ANNOTATION_REBOOT_NEEDED, op: Op::Equals, value: FALSE },
        Requirement { key: ANNOTATION_REBOOT_IN_PROGRESS, op: Op::Equals, value: FALSE },
    ])
}

/// Annotation set expected on a node while it is in the process of rebooting.
pub fn still_rebooting_selector() -> AnnotationSelector {
    AnnotationSelector(vec![
        Requirement { key: ANNOTATION_OK_TO_REBOOT, op: Op::Equals, value: TRUE },
        Requirement { key: ANNOTATION_REBOOT_NEEDED, op: Op::Equals, value: TRUE },
    ])
}

pub fn has_true_label(node: &Node, key: &str) -> bool {
    node.labels().get(key).map(String::as_str) == Some(TRUE)
}

/// True when every given annotation key is set to "true" on the node.
/// Trivially true for an empty list.
pub fn has_all_annotations(node: &Node, annotations: &[String]) -> bool {
    let node_annotations = node.annotations();
    annotations
        .iter()
        .all(|key| node_annotations.get(key).map(String::as_str) == Some(TRUE))
}
