//! Power off and destroy.

use std::time::Duration;

use tracing::info;
use vmctl_reconcile::{Action, Severity};

use super::{Pass, ReconcileError, Reconciler};
use crate::identity::ResolvedVm;
use crate::notifier::WaitConcern;
use crate::remote::{Operation, PowerState, RemoteApi, ToolsStatus};
use crate::resource::conditions::*;
use crate::resource::{PowerOffMode, VmPhase};
use crate::watch::PowerStateIs;

impl Reconciler {
    pub(super) async fn teardown(&self, pass: &mut Pass<'_>) -> Result<Action, ReconcileError> {
        if let Some(action) = self.guard_task(pass).await? {
            return Ok(action);
        }

        let Some(resolved) = self.resolve(pass).await? else {
            if pass.status.phase != VmPhase::Gone {
                info!("VM is gone");
            }
            pass.status.network.clear();
            pass.status.addresses.clear();
            pass.status.conditions.mark_false(
                VM_PROVISIONED,
                REASON_NOT_FOUND,
                Severity::Info,
                "VM has been destroyed",
                pass.now,
            );
            self.set_not_ready(pass, VmPhase::Gone, REASON_DELETING);
            return Ok(Action::Done);
        };

        if resolved.props.power_state != PowerState::PoweredOn {
            let soft_in_progress = pass
                .status
                .conditions
                .get(GUEST_SOFT_POWER_OFF_SUCCEEDED)
                .is_some_and(|c| c.reason == REASON_SOFT_POWER_OFF_IN_PROGRESS);
            if soft_in_progress {
                info!("Guest powered itself off");
                pass.status
                    .conditions
                    .mark_true(GUEST_SOFT_POWER_OFF_SUCCEEDED, pass.now);
            }

            self.set_not_ready(pass, VmPhase::Destroying, REASON_DELETING);
            return self
                .submit(
                    pass,
                    Operation::Destroy {
                        vm: resolved.vm_ref.clone(),
                    },
                )
                .await;
        }

        match pass.vm.spec.power_off_mode {
            PowerOffMode::Hard => self.hard_power_off(pass, &resolved).await,
            PowerOffMode::Soft | PowerOffMode::TrySoft => {
                self.soft_power_off(pass, &resolved).await
            }
        }
    }

    async fn hard_power_off(
        &self,
        pass: &mut Pass<'_>,
        resolved: &ResolvedVm,
    ) -> Result<Action, ReconcileError> {
        self.set_not_ready(pass, VmPhase::PoweringOff, REASON_POWERING_OFF);
        self.submit(
            pass,
            Operation::PowerOff {
                vm: resolved.vm_ref.clone(),
            },
        )
        .await
    }

    /// Ask the guest to shut down, and time the request out.
    ///
    /// The start of the shutdown is the transition time of the
    /// `GuestSoftPowerOffSucceeded` condition, so the timeout survives
    /// restarts.
    async fn soft_power_off(
        &self,
        pass: &mut Pass<'_>,
        resolved: &ResolvedVm,
    ) -> Result<Action, ReconcileError> {
        let mode = pass.vm.spec.power_off_mode;
        let timeout = pass
            .vm
            .spec
            .guest_soft_power_off_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.soft_power_off_timeout);

        let started = pass
            .status
            .conditions
            .get(GUEST_SOFT_POWER_OFF_SUCCEEDED)
            .filter(|c| {
                c.reason == REASON_SOFT_POWER_OFF_IN_PROGRESS
                    || c.reason == REASON_SOFT_POWER_OFF_FAILED
            })
            .map(|c| c.last_transition_time);

        let Some(started) = started else {
            if resolved.props.tools != ToolsStatus::Running {
                pass.status.conditions.mark_false(
                    GUEST_SOFT_POWER_OFF_SUCCEEDED,
                    REASON_GUEST_TOOLS_NOT_RUNNING,
                    Severity::Warning,
                    "guest tools are not running",
                    pass.now,
                );
                if mode == PowerOffMode::TrySoft {
                    info!("Guest tools unreachable, forcing power off");
                    return self.hard_power_off(pass, resolved).await;
                }
                self.set_not_ready(pass, VmPhase::PoweringOff, REASON_GUEST_TOOLS_NOT_RUNNING);
                return Ok(Action::requeue(self.config.task_poll_interval));
            }

            pass.session.shutdown_guest(&resolved.vm_ref).await?;
            info!(timeout_secs = timeout.as_secs(), "Requested guest shutdown");

            // Restart the clock even if an earlier attempt left the condition False.
            pass.status
                .conditions
                .remove(GUEST_SOFT_POWER_OFF_SUCCEEDED);
            pass.status.conditions.mark_false(
                GUEST_SOFT_POWER_OFF_SUCCEEDED,
                REASON_SOFT_POWER_OFF_IN_PROGRESS,
                Severity::Info,
                "guest shutdown requested",
                pass.now,
            );
            self.set_not_ready(pass, VmPhase::PoweringOff, REASON_POWERING_OFF);
            self.launch_watch(
                pass,
                &resolved.vm_ref,
                WaitConcern::PowerOff,
                PowerStateIs(PowerState::PoweredOff),
            );
            return Ok(Action::requeue(timeout));
        };

        let elapsed = (pass.now - started).to_std().unwrap_or_default();
        if elapsed < timeout {
            self.launch_watch(
                pass,
                &resolved.vm_ref,
                WaitConcern::PowerOff,
                PowerStateIs(PowerState::PoweredOff),
            );
            return Ok(Action::requeue(timeout - elapsed));
        }

        let message = format!("guest did not power off within {}s", timeout.as_secs());
        if mode == PowerOffMode::TrySoft {
            pass.status.conditions.mark_false(
                GUEST_SOFT_POWER_OFF_SUCCEEDED,
                REASON_SOFT_POWER_OFF_FAILED,
                Severity::Warning,
                message,
                pass.now,
            );
            info!("Guest shutdown timed out, forcing power off");
            return self.hard_power_off(pass, resolved).await;
        }

        pass.status.conditions.mark_false(
            GUEST_SOFT_POWER_OFF_SUCCEEDED,
            REASON_SOFT_POWER_OFF_FAILED,
            Severity::Error,
            message,
            pass.now,
        );
        self.set_not_ready(pass, VmPhase::PoweringOff, REASON_SOFT_POWER_OFF_FAILED);
        Ok(Action::requeue(self.config.task_poll_interval))
    }
}
