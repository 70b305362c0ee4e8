//! Scalar access to the loaded module
//!
//! Static fields, static methods, reflection and host natives. Values cross
//! as [`HostValue`] copies; nothing returned here points into the VM heap.

use crate::error::{VesselError, VesselResult};
use crate::Vessel;
use std::sync::Arc;
use vessel_engine::{ClassInfo, GcStats, HostValue, ValueKind};

fn expect_kind(field: &str, value: &HostValue, expected: ValueKind) -> VesselResult<()> {
    match value.kind() {
        ValueKind::Null => Err(VesselError::NullValue(field.to_string())),
        found if found == expected => Ok(()),
        found => Err(VesselError::TypeMismatch { expected, found }),
    }
}

impl Vessel {
    // ===== Static fields =====

    /// Read a static field
    pub fn get_static(&self, class: &str, field: &str) -> VesselResult<HostValue> {
        self.tracked(|| {
            self.with_loaded_vm(|vm| vm.get_static(class, field).map_err(VesselError::from))
        })
    }

    /// Write a static field
    ///
    /// Typed fields accept their declared kind or null.
    pub fn set_static(&self, class: &str, field: &str, value: HostValue) -> VesselResult<()> {
        self.tracked(|| {
            self.with_loaded_vm(|vm| {
                vm.set_static(class, field, value)
                    .map_err(VesselError::from)
            })
        })
    }

    fn get_typed(&self, class: &str, field: &str, kind: ValueKind) -> VesselResult<HostValue> {
        let value = self.get_static(class, field)?;
        self.tracked(|| {
            expect_kind(&format!("{class}.{field}"), &value, kind)?;
            Ok(value)
        })
    }

    /// Read an integer static
    pub fn get_static_int(&self, class: &str, field: &str) -> VesselResult<i32> {
        let value = self.get_typed(class, field, ValueKind::Int)?;
        Ok(value.as_int().unwrap_or_default())
    }

    /// Read a float static
    pub fn get_static_float(&self, class: &str, field: &str) -> VesselResult<f64> {
        let value = self.get_typed(class, field, ValueKind::Float)?;
        Ok(value.as_float().unwrap_or_default())
    }

    /// Read a boolean static
    pub fn get_static_bool(&self, class: &str, field: &str) -> VesselResult<bool> {
        let value = self.get_typed(class, field, ValueKind::Bool)?;
        Ok(value.as_bool().unwrap_or_default())
    }

    /// Read a string static
    pub fn get_static_string(&self, class: &str, field: &str) -> VesselResult<String> {
        match self.get_typed(class, field, ValueKind::String)? {
            HostValue::Str(s) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    /// Write an integer static
    pub fn set_static_int(&self, class: &str, field: &str, value: i32) -> VesselResult<()> {
        self.set_static(class, field, HostValue::Int(value))
    }

    /// Write a float static
    pub fn set_static_float(&self, class: &str, field: &str, value: f64) -> VesselResult<()> {
        self.set_static(class, field, HostValue::Float(value))
    }

    /// Write a boolean static
    pub fn set_static_bool(&self, class: &str, field: &str, value: bool) -> VesselResult<()> {
        self.set_static(class, field, HostValue::Bool(value))
    }

    /// Write a string static
    pub fn set_static_string(&self, class: &str, field: &str, value: &str) -> VesselResult<()> {
        self.set_static(class, field, HostValue::Str(value.to_string()))
    }

    // ===== Calls and reflection =====

    /// Call a static method
    pub fn call_static(
        &self,
        class: &str,
        method: &str,
        args: &[HostValue],
    ) -> VesselResult<HostValue> {
        self.tracked(|| {
            self.with_loaded_vm(|vm| {
                vm.call_static(class, method, args)
                    .map_err(VesselError::from)
            })
        })
    }

    /// Reflect a class by name
    pub fn find_type(&self, name: &str) -> VesselResult<ClassInfo> {
        self.tracked(|| {
            self.with_loaded_vm(|vm| {
                vm.class_info(name)
                    .ok_or_else(|| VesselError::TypeNotFound(name.to_string()))
            })
        })
    }

    /// Every class of the loaded module
    pub fn list_types(&self) -> VesselResult<Vec<ClassInfo>> {
        self.tracked(|| self.with_loaded_vm(|vm| Ok(vm.classes())))
    }

    // ===== Natives =====

    /// Register a host function callable from bytecode
    ///
    /// Natives are resolved when the module is linked, so register them
    /// before `load_*`; registering again replaces the handler in place.
    /// A native must not call back into this instance.
    pub fn register_native<F>(&self, name: &str, handler: F) -> VesselResult<()>
    where
        F: Fn(&[HostValue]) -> Result<HostValue, String> + Send + Sync + 'static,
    {
        self.tracked(|| {
            self.with_vm(|vm| {
                vm.register_native(name, Arc::new(handler));
                Ok(())
            })
        })?;
        tracing::debug!(native = name, "native registered");
        Ok(())
    }

    // ===== Collector =====

    /// Collect garbage now
    pub fn collect_garbage(&self) -> VesselResult<GcStats> {
        self.tracked(|| self.with_vm(|vm| vm.collect_garbage().map_err(VesselError::from)))
    }

    /// Collector statistics
    pub fn gc_stats(&self) -> VesselResult<GcStats> {
        self.tracked(|| self.with_vm(|vm| Ok(vm.gc_stats())))
    }
}
