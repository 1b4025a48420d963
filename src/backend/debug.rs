// Debug utils - validation messenger, object names, command labels
//
// The message filter is handed to the messenger explicitly (through the
// callback user data), so callers decide which message ids are silenced.

use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::vk::Handle;
use std::collections::BTreeSet;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use crate::error::Result;

/// Validation message ids known to be benign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugMessageFilter {
    suppressed: BTreeSet<i32>,
}

impl DebugMessageFilter {
    pub fn new(ids: impl IntoIterator<Item = i32>) -> Self {
        Self {
            suppressed: ids.into_iter().collect(),
        }
    }

    pub fn is_suppressed(&self, message_id: i32) -> bool {
        self.suppressed.contains(&message_id)
    }
}

/// Flattened copy of a messenger callback payload.
#[derive(Debug, Clone, Default)]
pub struct DebugMessage {
    pub severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    pub kind: vk::DebugUtilsMessageTypeFlagsEXT,
    pub id_number: i32,
    pub id_name: String,
    pub text: String,
    pub queue_labels: Vec<String>,
    pub command_labels: Vec<String>,
    pub objects: Vec<(vk::ObjectType, u64, String)>,
}

fn kind_name(kind: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

fn severity_name(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> &'static str {
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "error",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "warning",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "info",
        _ => "verbose",
    }
}

impl DebugMessage {
    pub fn render(&self) -> String {
        let mut out = format!(
            "[Vulkan {} {}] {} (0x{:08x}): {}",
            severity_name(self.severity),
            kind_name(self.kind),
            self.id_name,
            self.id_number as u32,
            self.text
        );
        for (ty, handle, name) in &self.objects {
            out.push_str(&format!("\n    object {:?} 0x{:x}", ty, handle));
            if !name.is_empty() {
                out.push_str(&format!(" '{}'", name));
            }
        }
        if !self.queue_labels.is_empty() {
            out.push_str(&format!("\n    queue labels: {}", self.queue_labels.join(" > ")));
        }
        if !self.command_labels.is_empty() {
            out.push_str(&format!("\n    command labels: {}", self.command_labels.join(" > ")));
        }
        out
    }

    /// Route through the log facade by severity.
    pub fn emit(&self) {
        let text = self.render();
        match self.severity {
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{}", text),
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{}", text),
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("{}", text),
            _ => log::debug!("{}", text),
        }
    }
}

unsafe fn opt_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

unsafe fn labels(ptr: *const vk::DebugUtilsLabelEXT, count: u32) -> Vec<String> {
    if ptr.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(ptr, count as usize)
        .iter()
        .map(|l| opt_str(l.p_label_name))
        .collect()
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;
    if !p_user_data.is_null() {
        let filter = &*(p_user_data as *const DebugMessageFilter);
        if filter.is_suppressed(data.message_id_number) {
            return vk::FALSE;
        }
    }

    let objects = if data.p_objects.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data.p_objects, data.object_count as usize)
            .iter()
            .map(|o| (o.object_type, o.object_handle, opt_str(o.p_object_name)))
            .collect()
    };

    DebugMessage {
        severity: message_severity,
        kind: message_type,
        id_number: data.message_id_number,
        id_name: opt_str(data.p_message_id_name),
        text: opt_str(data.p_message),
        queue_labels: labels(data.p_queue_labels, data.queue_label_count),
        command_labels: labels(data.p_cmd_buf_labels, data.cmd_buf_label_count),
        objects,
    }
    .emit();

    vk::FALSE
}

/// Debug messenger plus the filter its callback reads.
pub struct DebugMessenger {
    pub utils: DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
    // Boxed so the address given to the driver stays put.
    _filter: Box<DebugMessageFilter>,
}

impl DebugMessenger {
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        filter: DebugMessageFilter,
        callbacks: Option<&vk::AllocationCallbacks>,
    ) -> Result<Self> {
        let utils = DebugUtils::new(entry, instance);
        let filter = Box::new(filter);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(&*filter as *const DebugMessageFilter as *mut c_void);

        let messenger = unsafe { utils.create_debug_utils_messenger(&create_info, callbacks) }?;

        Ok(Self {
            utils,
            messenger,
            _filter: filter,
        })
    }

    pub fn destroy(&self, callbacks: Option<&vk::AllocationCallbacks>) {
        unsafe { self.utils.destroy_debug_utils_messenger(self.messenger, callbacks) };
    }
}

/// Attaches readable names to native handles when debug utils are loaded.
pub struct ObjectNamer {
    utils: Option<DebugUtils>,
    device: vk::Device,
}

impl ObjectNamer {
    pub fn new(utils: Option<DebugUtils>, device: vk::Device) -> Self {
        Self { utils, device }
    }

    pub fn is_enabled(&self) -> bool {
        self.utils.is_some()
    }

    pub fn utils(&self) -> Option<&DebugUtils> {
        self.utils.as_ref()
    }

    pub fn name<H: Handle>(&self, handle: H, name: &str) {
        let Some(utils) = &self.utils else { return };
        let Ok(name) = CString::new(name) else { return };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(e) = unsafe { utils.set_debug_utils_object_name(self.device, &info) } {
            log::debug!("Failed to name {:?}: {}", H::TYPE, e);
        }
    }
}

/// Begin/end of a labelled command region.
pub trait LabelRecorder {
    fn begin_label(&self, cmd: vk::CommandBuffer, name: &str);
    fn end_label(&self, cmd: vk::CommandBuffer);
}

impl LabelRecorder for DebugUtils {
    fn begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        let name = CString::new(name).unwrap_or_default();
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { self.cmd_begin_debug_utils_label(cmd, &label) };
    }

    fn end_label(&self, cmd: vk::CommandBuffer) {
        unsafe { self.cmd_end_debug_utils_label(cmd) };
    }
}

/// Closes its label region on every exit path.
pub struct LabelGuard<'a, R: LabelRecorder + ?Sized> {
    recorder: Option<&'a R>,
    cmd: vk::CommandBuffer,
}

impl<'a, R: LabelRecorder + ?Sized> LabelGuard<'a, R> {
    /// No-op guard when `recorder` is `None`.
    pub fn begin(recorder: Option<&'a R>, cmd: vk::CommandBuffer, name: &str) -> Self {
        if let Some(r) = recorder {
            r.begin_label(cmd, name);
        }
        Self { recorder, cmd }
    }
}

impl<R: LabelRecorder + ?Sized> Drop for LabelGuard<'_, R> {
    fn drop(&mut self) {
        if let Some(r) = self.recorder {
            r.end_label(self.cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl LabelRecorder for Recorder {
        fn begin_label(&self, _cmd: vk::CommandBuffer, name: &str) {
            self.events.borrow_mut().push(format!("begin {name}"));
        }

        fn end_label(&self, _cmd: vk::CommandBuffer) {
            self.events.borrow_mut().push("end".to_string());
        }
    }

    fn record(recorder: &Recorder, fail: bool) -> std::result::Result<(), ()> {
        let _outer = LabelGuard::begin(Some(recorder), vk::CommandBuffer::null(), "dispatch");
        let _inner = LabelGuard::begin(Some(recorder), vk::CommandBuffer::null(), "bind");
        if fail {
            return Err(());
        }
        Ok(())
    }

    #[test]
    fn label_guards_close_on_early_return() {
        let recorder = Recorder::default();
        assert!(record(&recorder, true).is_err());
        assert_eq!(
            *recorder.events.borrow(),
            vec!["begin dispatch", "begin bind", "end", "end"]
        );
    }

    #[test]
    fn disabled_guard_records_nothing() {
        let guard = LabelGuard::<Recorder>::begin(None, vk::CommandBuffer::null(), "x");
        drop(guard);
    }

    #[test]
    fn filter_matches_ids() {
        let filter = DebugMessageFilter::new([0x7f1922d7u32 as i32, 5]);
        assert!(filter.is_suppressed(5));
        assert!(filter.is_suppressed(0x7f1922d7u32 as i32));
        assert!(!filter.is_suppressed(6));
    }

    #[test]
    fn render_includes_id_objects_and_labels() {
        let msg = DebugMessage {
            severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            kind: vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            id_number: 0x10,
            id_name: "BestPractices-Example".into(),
            text: "something slow".into(),
            queue_labels: vec!["compute".into()],
            command_labels: vec!["dispatch".into(), "saxpy".into()],
            objects: vec![(vk::ObjectType::PIPELINE, 0xabc, "blur_main_pipeline".into())],
        };
        let text = msg.render();
        assert!(text.starts_with("[Vulkan warning performance] BestPractices-Example (0x00000010)"));
        assert!(text.contains("'blur_main_pipeline'"));
        assert!(text.contains("command labels: dispatch > saxpy"));
        assert!(text.contains("queue labels: compute"));
    }
}
