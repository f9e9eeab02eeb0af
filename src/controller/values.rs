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

use tokio::time::Duration;

pub const TRUE: &str = "true";
pub const FALSE: &str = "false";

// Label set on nodes selected for pre-reboot hook runs.
pub const LABEL_BEFORE_REBOOT: &str = "reboot.operator.io/before-reboot";
// Label set on nodes selected for post-reboot hook runs.
pub const LABEL_AFTER_REBOOT: &str = "reboot.operator.io/after-reboot";

// Operator -> agent: permission to proceed with the reboot.
pub const ANNOTATION_OK_TO_REBOOT: &str = "reboot.operator.io/ok-to-reboot";
// Agent -> operator: the host wants to reboot.
pub const ANNOTATION_REBOOT_NEEDED: &str = "reboot.operator.io/reboot-needed";
// Agent -> operator: the reboot has started and not yet finished.
pub const ANNOTATION_REBOOT_IN_PROGRESS: &str = "reboot.operator.io/reboot-in-progress";
// User override excluding the node from reboot scheduling.
pub const ANNOTATION_REBOOT_PAUSED: &str = "reboot.operator.io/reboot-paused";

pub const LEADER_ELECTION_RESOURCE_NAME: &str = "reboot-operator-lock";
pub const LEADER_ELECTION_SOURCE_COMPONENT: &str = "reboot-operator-leader-election";
pub const LOCK_TYPE_LEASES: &str = "leases";

pub const DEFAULT_MAX_REBOOTING_NODES: usize = 1;
pub const DEFAULT_RECONCILIATION_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_LEADER_ELECTION_LEASE: Duration = Duration::from_secs(90);
