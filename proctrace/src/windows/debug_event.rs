// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use winapi::um::minwinbase::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_PROCESS_DEBUG_INFO, CREATE_THREAD_DEBUG_EVENT,
    CREATE_THREAD_DEBUG_INFO, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXCEPTION_DEBUG_INFO,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_PROCESS_DEBUG_INFO, EXIT_THREAD_DEBUG_EVENT,
    EXIT_THREAD_DEBUG_INFO, LOAD_DLL_DEBUG_EVENT, LOAD_DLL_DEBUG_INFO, UNLOAD_DLL_DEBUG_EVENT,
    UNLOAD_DLL_DEBUG_INFO,
};

pub enum DebugEventInfo<'a> {
    CreateProcess(&'a CREATE_PROCESS_DEBUG_INFO),
    CreateThread(&'a CREATE_THREAD_DEBUG_INFO),
    Exception(&'a EXCEPTION_DEBUG_INFO),
    ExitProcess(&'a EXIT_PROCESS_DEBUG_INFO),
    ExitThread(&'a EXIT_THREAD_DEBUG_INFO),
    LoadDll(&'a LOAD_DLL_DEBUG_INFO),
    UnloadDll(&'a UNLOAD_DLL_DEBUG_INFO),
    Unknown,
}

pub struct DebugEvent<'a> {
    process_id: u32,
    thread_id: u32,
    info: DebugEventInfo<'a>,
}

impl<'a> DebugEvent<'a> {
    pub fn new(de: &'a DEBUG_EVENT) -> Self {
        // Safe as long as we only access the union member keyed by the
        // event code.
        let info = unsafe {
            match de.dwDebugEventCode {
                EXCEPTION_DEBUG_EVENT => DebugEventInfo::Exception(de.u.Exception()),
                CREATE_THREAD_DEBUG_EVENT => DebugEventInfo::CreateThread(de.u.CreateThread()),
                CREATE_PROCESS_DEBUG_EVENT => {
                    DebugEventInfo::CreateProcess(de.u.CreateProcessInfo())
                }
                EXIT_THREAD_DEBUG_EVENT => DebugEventInfo::ExitThread(de.u.ExitThread()),
                EXIT_PROCESS_DEBUG_EVENT => DebugEventInfo::ExitProcess(de.u.ExitProcess()),
                LOAD_DLL_DEBUG_EVENT => DebugEventInfo::LoadDll(de.u.LoadDll()),
                UNLOAD_DLL_DEBUG_EVENT => DebugEventInfo::UnloadDll(de.u.UnloadDll()),
                _ => DebugEventInfo::Unknown,
            }
        };

        Self {
            process_id: de.dwProcessId,
            thread_id: de.dwThreadId,
            info,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn info(&self) -> &DebugEventInfo<'a> {
        &self.info
    }
}

impl fmt::Display for DebugEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "process {} thread {}: ",
            self.process_id, self.thread_id
        )?;

        match self.info {
            DebugEventInfo::CreateProcess(info) => {
                write!(f, "CreateProcess base {:x}", info.lpBaseOfImage as u64)
            }
            DebugEventInfo::CreateThread(_) => {
                write!(f, "CreateThread")
            }
            DebugEventInfo::Exception(info) => {
                write!(
                    f,
                    "Exception code {:#x} address {:x} first_chance {}",
                    info.ExceptionRecord.ExceptionCode,
                    info.ExceptionRecord.ExceptionAddress as u64,
                    info.dwFirstChance,
                )
            }
            DebugEventInfo::ExitProcess(info) => {
                write!(f, "ExitProcess code {}", info.dwExitCode)
            }
            DebugEventInfo::ExitThread(info) => {
                write!(f, "ExitThread code {}", info.dwExitCode)
            }
            DebugEventInfo::LoadDll(info) => {
                write!(f, "LoadDll base {:x}", info.lpBaseOfDll as u64)
            }
            DebugEventInfo::UnloadDll(info) => {
                write!(f, "UnloadDll base {:x}", info.lpBaseOfDll as u64)
            }
            DebugEventInfo::Unknown => {
                write!(f, "Unknown")
            }
        }
    }
}
