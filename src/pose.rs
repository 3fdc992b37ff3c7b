//! Pose tracker
//!
//! Pulls every tracked device's pose once per frame and keeps the last good
//! transform for each slot. Also derives the head pose, the room-to-head
//! transform every eye's view matrix starts from.

use glam::Mat4;
use log::warn;

use crate::math::{to_affine_matrix4x4, AffineTransform};
use crate::runtime::{
    TrackedDeviceClass, TrackedDevicePose, VrRuntime, HMD_DEVICE_INDEX, MAX_TRACKED_DEVICE_COUNT,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceSlot {
    /// Device-to-tracking transform from the last frame the pose was valid.
    pub transform: AffineTransform,
    /// Whether the pose was valid in the most recent frame.
    pub pose_valid: bool,
    /// Set on the first valid pose, then never changed.
    pub class: Option<TrackedDeviceClass>,
}

/// Fixed per-device storage, one slot per tracked-device index.
#[derive(Debug, Clone)]
pub struct DeviceTable {
    slots: [DeviceSlot; MAX_TRACKED_DEVICE_COUNT],
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self {
            slots: [DeviceSlot::default(); MAX_TRACKED_DEVICE_COUNT],
        }
    }
}

impl DeviceTable {
    pub fn slot(&self, index: usize) -> Option<&DeviceSlot> {
        self.slots.get(index)
    }

    pub fn transform(&self, index: usize) -> Option<AffineTransform> {
        self.slots.get(index).map(|slot| slot.transform)
    }

    pub fn is_pose_valid(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.pose_valid)
    }

    pub fn class(&self, index: usize) -> Option<TrackedDeviceClass> {
        self.slots.get(index).and_then(|slot| slot.class)
    }

    pub fn class_tag(&self, index: usize) -> Option<char> {
        self.class(index).map(TrackedDeviceClass::tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &DeviceSlot)> {
        self.slots.iter().enumerate()
    }
}

/// What one pose update observed.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSnapshot {
    pub valid_pose_count: usize,
    /// Class tags of this frame's valid devices, in index order.
    pub pose_classes: String,
    pub hmd_pose_valid: bool,
    pub head_pose: Mat4,
}

pub struct PoseTracker {
    devices: DeviceTable,
    head_pose: Mat4,
    poses: [TrackedDevicePose; MAX_TRACKED_DEVICE_COUNT],
}

impl Default for PoseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseTracker {
    pub fn new() -> Self {
        Self {
            devices: DeviceTable::default(),
            head_pose: Mat4::IDENTITY,
            poses: [TrackedDevicePose::INVALID; MAX_TRACKED_DEVICE_COUNT],
        }
    }

    /// Blocks in the runtime until the next frame's poses are ready, then
    /// folds them into the device table.
    pub fn update_poses<R: VrRuntime + ?Sized>(&mut self, runtime: &mut R) -> PoseSnapshot {
        if let Err(e) = runtime.wait_get_poses(&mut self.poses) {
            warn!("WaitGetPoses failed, treating every pose as invalid: {}", e);
            self.poses = [TrackedDevicePose::INVALID; MAX_TRACKED_DEVICE_COUNT];
        }

        let mut valid_pose_count = 0;
        let mut pose_classes = String::new();

        for (index, pose) in self.poses.iter().enumerate() {
            let slot = &mut self.devices.slots[index];
            slot.pose_valid = pose.pose_is_valid;
            if !pose.pose_is_valid {
                continue;
            }

            valid_pose_count += 1;
            slot.transform = to_affine_matrix4x4(&pose.device_to_absolute_tracking);
            let class = *slot
                .class
                .get_or_insert_with(|| runtime.tracked_device_class(index));
            pose_classes.push(class.tag());
        }

        let hmd_pose_valid = self.poses[HMD_DEVICE_INDEX].pose_is_valid;
        if hmd_pose_valid {
            self.head_pose = self.devices.slots[HMD_DEVICE_INDEX]
                .transform
                .inverse()
                .to_mat4();
        }

        PoseSnapshot {
            valid_pose_count,
            pose_classes,
            hmd_pose_valid,
            head_pose: self.head_pose,
        }
    }

    pub fn head_pose(&self) -> Mat4 {
        self.head_pose
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// The raw pose array from the last update.
    pub fn raw_poses(&self) -> &[TrackedDevicePose; MAX_TRACKED_DEVICE_COUNT] {
        &self.poses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::RawMatrix34;
    use crate::testing::{translation_pose, MockRuntime};
    use glam::Vec3;

    #[test]
    fn invalid_hmd_pose_keeps_last_known_head_pose() {
        let mut runtime = MockRuntime::new();
        runtime.set_class(0, TrackedDeviceClass::Hmd);
        runtime.push_frame(vec![(0, translation_pose(Vec3::new(0.0, 1.7, 0.0)))]);
        runtime.push_frame(vec![]);

        let mut tracker = PoseTracker::new();
        let first = tracker.update_poses(&mut runtime);
        assert!(first.hmd_pose_valid);
        let expected = Mat4::from_translation(Vec3::new(0.0, -1.7, 0.0));
        assert!(first.head_pose.abs_diff_eq(expected, 1e-6));

        let second = tracker.update_poses(&mut runtime);
        assert!(!second.hmd_pose_valid);
        assert_eq!(second.head_pose, first.head_pose);
        assert_eq!(second.valid_pose_count, 0);
    }

    #[test]
    fn invalid_device_pose_retains_prior_transform() {
        let mut runtime = MockRuntime::new();
        runtime.set_class(3, TrackedDeviceClass::Controller);
        runtime.push_frame(vec![(3, translation_pose(Vec3::new(0.2, 1.0, -0.3)))]);
        runtime.push_frame(vec![]);

        let mut tracker = PoseTracker::new();
        tracker.update_poses(&mut runtime);
        let before = tracker.devices().transform(3);
        tracker.update_poses(&mut runtime);

        assert!(!tracker.devices().is_pose_valid(3));
        assert_eq!(tracker.devices().transform(3), before);
        assert_eq!(
            tracker.devices().transform(3).map(|t| t.translation()),
            Some(Vec3::new(0.2, 1.0, -0.3))
        );
    }

    #[test]
    fn class_tag_is_written_once() {
        let mut runtime = MockRuntime::new();
        runtime.set_class(0, TrackedDeviceClass::Hmd);
        runtime.set_class(1, TrackedDeviceClass::Controller);
        let pose = translation_pose(Vec3::ZERO);
        runtime.push_frame(vec![(0, pose), (1, pose)]);
        runtime.push_frame(vec![(0, pose), (1, pose)]);

        let mut tracker = PoseTracker::new();
        let first = tracker.update_poses(&mut runtime);
        assert_eq!(first.pose_classes, "HC");

        // The runtime now reports something else; the tag must not follow.
        runtime.set_class(1, TrackedDeviceClass::TrackingReference);
        let second = tracker.update_poses(&mut runtime);
        assert_eq!(second.pose_classes, "HC");
        assert_eq!(tracker.devices().class_tag(1), Some('C'));
        assert_eq!(tracker.devices().class(2), None);
    }

    #[test]
    fn failed_pose_request_invalidates_the_frame() {
        let mut runtime = MockRuntime::new();
        runtime.set_class(0, TrackedDeviceClass::Hmd);
        runtime.push_frame(vec![(0, translation_pose(Vec3::new(0.0, 1.5, 0.0)))]);
        let mut tracker = PoseTracker::new();
        let first = tracker.update_poses(&mut runtime);

        runtime.fail_next_pose_request();
        let second = tracker.update_poses(&mut runtime);
        assert_eq!(second.valid_pose_count, 0);
        assert_eq!(second.head_pose, first.head_pose);
        assert_eq!(
            tracker.raw_poses()[0].device_to_absolute_tracking,
            RawMatrix34::IDENTITY
        );
    }
}
