//! Multi-sensor rig bookkeeping.
//!
//! A rig is a set of rigidly mounted sensors. One reference sensor defines the
//! rig frame; every other sensor carries an (optionally unknown)
//! `sensor_from_rig` transform. Frames store a single `rig_from_world` pose and
//! derive each image pose through the rig.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SfmError};
use crate::geometry::Rigid3d;
use crate::scene::{CameraId, RigId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorType {
    Camera,
    Imu,
}

/// Sensor identifier: the sensor type plus its id within that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId {
    pub sensor_type: SensorType,
    pub id: u32,
}

impl SensorId {
    pub fn new(sensor_type: SensorType, id: u32) -> Self {
        Self { sensor_type, id }
    }

    /// Sensor id of a camera.
    pub fn camera(camera_id: CameraId) -> Self {
        Self::new(SensorType::Camera, camera_id.0)
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:?}, {})", self.sensor_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rig {
    pub rig_id: RigId,
    ref_sensor_id: Option<SensorId>,
    /// Non-reference sensors; `None` means the extrinsics are not known yet.
    sensors_from_rig: BTreeMap<SensorId, Option<Rigid3d>>,
}

impl Rig {
    pub fn new(rig_id: RigId) -> Self {
        Self {
            rig_id,
            ref_sensor_id: None,
            sensors_from_rig: BTreeMap::new(),
        }
    }

    /// Single-camera rig, the common case for unstructured image collections.
    pub fn with_camera(rig_id: RigId, camera_id: CameraId) -> Self {
        Self {
            rig_id,
            ref_sensor_id: Some(SensorId::camera(camera_id)),
            sensors_from_rig: BTreeMap::new(),
        }
    }

    /// Set the reference sensor.
    ///
    /// # Errors
    /// * `ReferenceSensorAlreadySet` if the rig already has one
    pub fn add_ref_sensor(&mut self, sensor_id: SensorId) -> Result<()> {
        if self.ref_sensor_id.is_some() {
            return Err(SfmError::ReferenceSensorAlreadySet(self.rig_id));
        }
        self.ref_sensor_id = Some(sensor_id);
        Ok(())
    }

    /// Add a non-reference sensor.
    ///
    /// # Errors
    /// * `MissingReferenceSensor` if no reference sensor was added yet
    /// * `DuplicateSensor` if the sensor is already part of the rig
    pub fn add_sensor(
        &mut self,
        sensor_id: SensorId,
        sensor_from_rig: Option<Rigid3d>,
    ) -> Result<()> {
        if self.num_sensors() == 0 {
            return Err(SfmError::MissingReferenceSensor(self.rig_id));
        }
        if self.has_sensor(sensor_id) {
            return Err(SfmError::DuplicateSensor {
                rig: self.rig_id,
                sensor: sensor_id,
            });
        }
        self.sensors_from_rig.insert(sensor_id, sensor_from_rig);
        Ok(())
    }

    pub fn ref_sensor_id(&self) -> Option<SensorId> {
        self.ref_sensor_id
    }

    pub fn is_ref_sensor(&self, sensor_id: SensorId) -> bool {
        self.ref_sensor_id == Some(sensor_id)
    }

    pub fn has_sensor(&self, sensor_id: SensorId) -> bool {
        self.is_ref_sensor(sensor_id) || self.sensors_from_rig.contains_key(&sensor_id)
    }

    pub fn num_sensors(&self) -> usize {
        usize::from(self.ref_sensor_id.is_some()) + self.sensors_from_rig.len()
    }

    /// All sensors, reference sensor first.
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        self.ref_sensor_id
            .into_iter()
            .chain(self.sensors_from_rig.keys().copied())
            .collect()
    }

    /// Non-reference sensors.
    pub fn non_ref_sensor_ids(&self) -> impl Iterator<Item = SensorId> + '_ {
        self.sensors_from_rig.keys().copied()
    }

    /// Transform from the rig frame into the sensor frame.
    ///
    /// Identity for the reference sensor, `None` for unknown sensors or
    /// sensors whose extrinsics are not calibrated.
    pub fn sensor_from_rig(&self, sensor_id: SensorId) -> Option<Rigid3d> {
        if self.is_ref_sensor(sensor_id) {
            return Some(Rigid3d::identity());
        }
        self.sensors_from_rig.get(&sensor_id).copied().flatten()
    }

    /// Update the extrinsics of a non-reference sensor.
    ///
    /// # Returns
    /// * `false` if the sensor is the reference sensor or not in the rig
    pub fn set_sensor_from_rig(&mut self, sensor_id: SensorId, sensor_from_rig: Rigid3d) -> bool {
        match self.sensors_from_rig.get_mut(&sensor_id) {
            Some(slot) => {
                *slot = Some(sensor_from_rig);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Display for Rig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rig(rig_id={}, sensors=[", self.rig_id)?;
        let ids = self.sensor_ids();
        for (i, sensor_id) in ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", sensor_id)?;
        }
        write!(f, "])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn cam(id: u32) -> SensorId {
        SensorId::new(SensorType::Camera, id)
    }

    #[test]
    fn test_reference_sensor_must_come_first() {
        let mut rig = Rig::new(RigId::new(1));
        assert_eq!(
            rig.add_sensor(cam(2), None),
            Err(SfmError::MissingReferenceSensor(RigId::new(1)))
        );
        rig.add_ref_sensor(cam(1)).unwrap();
        rig.add_sensor(cam(2), None).unwrap();
        assert_eq!(rig.num_sensors(), 2);
    }

    #[test]
    fn test_duplicate_sensor_rejected() {
        let mut rig = Rig::new(RigId::new(1));
        rig.add_ref_sensor(cam(1)).unwrap();
        rig.add_sensor(cam(2), None).unwrap();

        assert!(matches!(
            rig.add_sensor(cam(2), None),
            Err(SfmError::DuplicateSensor { .. })
        ));
        // The reference sensor counts as present too
        assert!(matches!(
            rig.add_sensor(cam(1), None),
            Err(SfmError::DuplicateSensor { .. })
        ));
        // Same id, different type is a different sensor
        rig.add_sensor(SensorId::new(SensorType::Imu, 2), None).unwrap();
    }

    #[test]
    fn test_second_reference_sensor_rejected() {
        let mut rig = Rig::new(RigId::new(3));
        rig.add_ref_sensor(cam(1)).unwrap();
        assert_eq!(
            rig.add_ref_sensor(cam(2)),
            Err(SfmError::ReferenceSensorAlreadySet(RigId::new(3)))
        );
        assert_eq!(rig.ref_sensor_id(), Some(cam(1)));
    }

    #[test]
    fn test_sensor_from_rig() {
        let mut rig = Rig::with_camera(RigId::new(1), CameraId::new(1));
        let extrinsics = Rigid3d::from_axis_angle(Vector3::zeros(), Vector3::new(0.2, 0.0, 0.0));
        rig.add_sensor(cam(2), None).unwrap();

        assert_eq!(rig.sensor_from_rig(cam(1)), Some(Rigid3d::identity()));
        assert_eq!(rig.sensor_from_rig(cam(2)), None);
        assert!(rig.set_sensor_from_rig(cam(2), extrinsics));
        assert_eq!(rig.sensor_from_rig(cam(2)), Some(extrinsics));
        assert!(!rig.set_sensor_from_rig(cam(1), extrinsics));
        assert_eq!(rig.sensor_ids(), vec![cam(1), cam(2)]);
    }
}
