//! Provides a minimal rust wrapper for parts of the NI-DAQmx C library.
//!
//! ## Overview
//!
//! [`NiTask`] encapsulates a DAQmx task handle and maps the [`DaqTask`] calls onto DAQmx
//! C-functions; [`NiDaq`] creates the counter, analog and digital tasks the coordinator needs.
//! Only compiled with the `nidaqmx` cargo feature, which links against `NIDAQmx`.
//!
//! ## Error handling
//!
//! Every DAQmx C-function returns an `int32` that is negative on failure. [`daqmx_call`] turns
//! such codes into [`DaqError::Driver`] carrying the extended error string, except the
//! wait-until-done timeout codes which become [`DaqError::Timeout`]. Nothing here panics.
//!
//! ## Cleanup
//!
//! [`NiTask`] clears its handle on `Drop` unless it was already closed.
//!
//! For details on the driver calls see the
//! [NI-DAQmx C Reference](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html).

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aslm_compiler_backend::CameraPulse;
use ndarray::Array2;
use tracing::{debug, error};

use crate::daq::{DaqBackend, DaqError, DaqTask, Result, TaskKind};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_SECONDS: CInt32 = 10364;
pub const DAQMX_VAL_LOW: CInt32 = 10214;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_GROUPBYSCANNUMBER: CBool32 = 1;
pub const DAQMX_VAL_CHANFORALLLINES: CInt32 = 1;

/// Status codes DAQmx reports when `DAQmxWaitUntilTaskDone` runs out of time.
pub const DAQMX_TIMEOUT_CODES: [CInt32; 2] = [-200560, -200474];

/// Write timeout in seconds; the coordinator writes stopped tasks so this never blocks long.
const WRITE_TIMEOUT: CFloat64 = 10.0;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;
    fn DAQmxIsTaskDone(handle: TaskHandle, isTaskDone: *mut CBool32) -> CInt32;
    fn DAQmxWaitUntilTaskDone(handle: TaskHandle, timeToWait: CFloat64) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;
    fn DAQmxCfgImplicitTiming(handle: TaskHandle, sampleMode: CInt32, sampsPerChan: CUint64)
        -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateDOChan(
        handle: TaskHandle,
        lines: CConstStr,
        name: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;
    fn DAQmxCreateCOPulseChanTime(
        handle: TaskHandle,
        counter: CConstStr,
        nameToAssignToChannel: CConstStr,
        units: CInt32,
        idleState: CInt32,
        initialDelay: CFloat64,
        lowTime: CFloat64,
        highTime: CFloat64,
    ) -> CInt32;

    fn DAQmxWriteDigitalLines(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const u8,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;

    fn DAQmxCfgDigEdgeStartTrig(
        handle: TaskHandle,
        triggerSource: CConstStr,
        triggerEdge: CInt32,
    ) -> CInt32;
    fn DAQmxSetStartTrigRetriggerable(handle: TaskHandle, data: CBool32) -> CInt32;
}

fn extended_error_info() -> String {
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Calls a DAQmx C-function and converts a negative status into a [`DaqError::Driver`].
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<()> {
    let code = func();
    if code < 0 {
        let message = extended_error_info();
        if DAQMX_TIMEOUT_CODES.contains(&code) {
            debug!(code, %message, "DAQmx wait timed out");
        } else {
            error!(code, %message, "DAQmx call failed");
        }
        return Err(DaqError::Driver { code, message });
    }
    Ok(())
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| DaqError::Driver {
        code: 0,
        message: format!("Failed to convert '{}' to CString", value),
    })
}

pub fn reset_ni_device(name: &str) -> Result<()> {
    let name_cstr = c_string(name)?;
    daqmx_call(|| unsafe { DAQmxResetDevice(name_cstr.as_ptr()) })
}

/// One NI-DAQmx task handle.
pub struct NiTask {
    handle: TaskHandle,
    name: String,
    kind: TaskKind,
    closed: AtomicBool,
}

// DAQmx task handles are safe to use from any thread; the driver serializes calls per task.
unsafe impl Send for NiTask {}
unsafe impl Sync for NiTask {}

impl NiTask {
    pub fn new(name: &str, kind: TaskKind) -> Result<Self> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = c_string("")?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })?;
        Ok(Self {
            handle: taskhandle,
            name: name.to_string(),
            kind,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaqError::TaskClosed(self.name.clone()));
        }
        Ok(())
    }

    pub fn cfg_sample_clk(&self, clk_src: &str, samp_rate: f64, seq_len: u64) -> Result<()> {
        let src_cstring = c_string(clk_src)?;
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                seq_len as CUint64,
            )
        })
    }

    pub fn cfg_implicit_timing(&self, samps_per_chan: u64) -> Result<()> {
        daqmx_call(|| unsafe {
            DAQmxCfgImplicitTiming(self.handle, DAQMX_VAL_FINITESAMPS, samps_per_chan as CUint64)
        })
    }

    pub fn create_ao_chan(&self, name: &str) -> Result<()> {
        let name_cstr = c_string(name)?;
        let assigned_name_cstr = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                -10.,
                10.,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })
    }

    pub fn create_do_chan(&self, name: &str) -> Result<()> {
        let name_cstr = c_string(name)?;
        let assigned_name_cstr = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateDOChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CHANFORALLLINES,
            )
        })
    }

    pub fn create_co_pulse_chan(&self, counter: &str, pulse: &CameraPulse) -> Result<()> {
        let counter_cstr = c_string(counter)?;
        let assigned_name_cstr = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCreateCOPulseChanTime(
                self.handle,
                counter_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_SECONDS,
                DAQMX_VAL_LOW,
                pulse.initial_delay as CFloat64,
                pulse.low_time as CFloat64,
                pulse.high_time as CFloat64,
            )
        })
    }
}

impl DaqTask for NiTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn start(&self) -> Result<()> {
        self.check_open()?;
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }

    fn stop(&self) -> Result<()> {
        self.check_open()?;
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DaqError::TaskClosed(self.name.clone()));
        }
        daqmx_call(|| unsafe { DAQmxClearTask(self.handle) })
    }

    fn is_task_done(&self) -> Result<bool> {
        self.check_open()?;
        let mut done: CBool32 = 0;
        daqmx_call(|| unsafe { DAQmxIsTaskDone(self.handle, &mut done as *mut CBool32) })?;
        Ok(done != 0)
    }

    fn wait_until_done(&self, timeout: Duration) -> Result<()> {
        self.check_open()?;
        match daqmx_call(|| unsafe {
            DAQmxWaitUntilTaskDone(self.handle, timeout.as_secs_f64() as CFloat64)
        }) {
            Err(DaqError::Driver { code, .. }) if DAQMX_TIMEOUT_CODES.contains(&code) => {
                Err(DaqError::Timeout {
                    task: self.name.clone(),
                    timeout,
                })
            }
            other => other,
        }
    }

    fn cfg_dig_edge_start_trigger(&self, source: &str) -> Result<()> {
        self.check_open()?;
        let trigger_source_cstr = c_string(source)?;
        daqmx_call(|| unsafe {
            DAQmxCfgDigEdgeStartTrig(self.handle, trigger_source_cstr.as_ptr(), DAQMX_VAL_RISING)
        })
    }

    fn set_retriggerable(&self, retriggerable: bool) -> Result<()> {
        self.check_open()?;
        daqmx_call(|| unsafe {
            DAQmxSetStartTrigRetriggerable(self.handle, retriggerable as CBool32)
        })
    }

    fn write_analog(&self, buffer: &Array2<f64>) -> Result<usize> {
        self.check_open()?;
        let contiguous = buffer.as_standard_layout();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                contiguous.shape()[1] as CInt32,
                false as CBool32,
                WRITE_TIMEOUT,
                0, // group by channel: rows are channels
                contiguous.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    fn write_digital_lines(&self, pattern: &[bool]) -> Result<usize> {
        self.check_open()?;
        let samples: Vec<u8> = pattern.iter().map(|&high| high as u8).collect();
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteDigitalLines(
                self.handle,
                samples.len() as CInt32,
                true as CBool32,
                WRITE_TIMEOUT,
                DAQMX_VAL_GROUPBYSCANNUMBER,
                samples.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(err) = daqmx_call(|| unsafe { DAQmxClearTask(self.handle) }) {
                debug!(task = %self.name, %err, "failed to clear task on drop");
            }
        }
    }
}

/// NI-DAQmx backend.
#[derive(Default)]
pub struct NiDaq;

impl DaqBackend for NiDaq {
    type Task = NiTask;

    fn create_co_pulse_task(
        &self,
        name: &str,
        counter: &str,
        pulse: &CameraPulse,
    ) -> Result<NiTask> {
        let task = NiTask::new(name, TaskKind::CounterOutput)?;
        task.create_co_pulse_chan(counter, pulse)?;
        task.cfg_implicit_timing(pulse.pulses as u64)?;
        Ok(task)
    }

    fn create_ao_task(
        &self,
        name: &str,
        channels: &[String],
        samp_rate: f64,
        samps_per_chan: usize,
    ) -> Result<NiTask> {
        let task = NiTask::new(name, TaskKind::AnalogOutput)?;
        for chan in channels {
            task.create_ao_chan(chan)?;
        }
        task.cfg_sample_clk("", samp_rate, samps_per_chan as u64)?;
        Ok(task)
    }

    fn create_do_task(&self, name: &str, lines: &str) -> Result<NiTask> {
        let task = NiTask::new(name, TaskKind::DigitalOutput)?;
        task.create_do_chan(lines)?;
        Ok(task)
    }

    fn reset_device(&self, device: &str) -> Result<()> {
        reset_ni_device(device)
    }
}
