use std::collections::HashMap;

use drm::control::{property, Device as ControlDevice, RawResourceHandle, ResourceHandle};

use crate::{device::PropertyTarget, topology::ObjectId};

/// A property name unknown to the device
#[derive(thiserror::Error, Debug)]
#[error("The device is missing the required property '{name}' for {target:?}")]
pub struct UnknownProperty {
    /// Object the property was set on
    pub target: PropertyTarget,
    /// Property name
    pub name: &'static str,
}

#[derive(Clone, Debug, Default)]
pub struct PropMapping {
    pub connectors: HashMap<ObjectId, HashMap<String, property::Handle>>,
    pub crtcs: HashMap<ObjectId, HashMap<String, property::Handle>>,
    pub planes: HashMap<ObjectId, HashMap<String, property::Handle>>,
}

impl PropMapping {
    pub fn prop_handle(
        &self,
        target: PropertyTarget,
        name: &'static str,
    ) -> Result<(RawResourceHandle, property::Handle), UnknownProperty> {
        let map = match target {
            PropertyTarget::Connector(_) => &self.connectors,
            PropertyTarget::Crtc(_) => &self.crtcs,
            PropertyTarget::Plane(_) => &self.planes,
        };
        let unknown = || UnknownProperty { target, name };
        let prop = map
            .get(&target.id())
            .and_then(|props| props.get(name))
            .copied()
            .ok_or_else(unknown)?;
        let object = RawResourceHandle::new(target.id().0).ok_or_else(unknown)?;
        Ok((object, prop))
    }
}

/// Create a mapping of property names and handles for given handles of a given drm resource type.
pub fn map_props<D, T>(
    fd: &D,
    handles: &[T],
    mapping: &mut HashMap<ObjectId, HashMap<String, property::Handle>>,
) -> std::io::Result<()>
where
    D: ControlDevice,
    T: ResourceHandle + Into<u32>,
{
    for handle in handles {
        let props = fd.get_properties(*handle)?;
        let (prop_handles, _) = props.as_props_and_values();
        let mut map = HashMap::new();
        for prop in prop_handles {
            if let Ok(info) = fd.get_property(*prop) {
                let name = info.name().to_string_lossy().into_owned();
                map.insert(name, *prop);
            }
        }
        mapping.insert(ObjectId((*handle).into()), map);
    }
    Ok(())
}

/// Read the value of a property by name
pub fn prop_value<D, T>(fd: &D, handle: T, name: &str) -> std::io::Result<Option<u64>>
where
    D: ControlDevice,
    T: ResourceHandle,
{
    let props = fd.get_properties(handle)?;
    let (ids, vals) = props.as_props_and_values();
    for (&id, &val) in ids.iter().zip(vals.iter()) {
        if let Ok(info) = fd.get_property(id) {
            if info.name().to_str().map(|x| x == name).unwrap_or(false) {
                return Ok(Some(val));
            }
        }
    }
    Ok(None)
}
