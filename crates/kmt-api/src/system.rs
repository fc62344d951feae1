// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loader and host backed by the running system.

/// Loads the driver module through the OS dynamic loader.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemLoader;

/// OS facilities of the running system.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemHost;

#[cfg(windows)]
mod imp {
    use std::io::{Error, ErrorKind, Result};
    use std::os::raw::c_void;
    use std::ptr::{null, NonNull};
    use std::sync::Arc;

    use libloading::Library;
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::Graphics::Gdi::{
        CreateDCW, DeleteDC, EnumDisplayDevicesW, DISPLAY_DEVICEW,
    };
    use windows_sys::Win32::System::Threading::{
        CreateEventW, CreateSemaphoreW,
    };

    use super::{SystemHost, SystemLoader};
    use crate::*;

    const DISPLAY_DEVICE_PRIMARY_DEVICE: u32 = 0x4;

    impl Loader for SystemLoader {
        fn load(&self, name: &str) -> Result<Box<dyn Module>> {
            // Safety: the display-driver modules we load have no
            // initialization routines with preconditions of their own.
            let lib = unsafe { Library::new(name) }
                .map_err(|e| Error::new(ErrorKind::NotFound, e))?;
            Ok(Box::new(GdiModule { lib }))
        }
    }

    struct GdiModule {
        lib: Library,
    }

    impl Module for GdiModule {
        fn resolve(&self, entry: EntryPoint) -> Option<NonNull<c_void>> {
            // Safety: only the address is taken here; it is given its real
            // type in `bind`.
            let sym =
                unsafe { self.lib.get::<*mut c_void>(entry.name().as_bytes()) }
                    .ok()?;
            NonNull::new(*sym)
        }

        unsafe fn bind(&self, table: &EntryTable) -> Arc<dyn Thunks> {
            macro_rules! thunk {
                ($entry:ident) => {
                    std::mem::transmute::<*const c_void, _>(
                        table.get(EntryPoint::$entry),
                    )
                };
            }
            Arc::new(GdiThunks {
                open_adapter_from_hdc: thunk!(OpenAdapterFromHdc),
                open_adapter_from_gdi_display_name: thunk!(
                    OpenAdapterFromGdiDisplayName
                ),
                close_adapter: thunk!(CloseAdapter),
                escape: thunk!(Escape),
                create_device: thunk!(CreateDevice),
                destroy_device: thunk!(DestroyDevice),
                create_context: thunk!(CreateContext),
                destroy_context: thunk!(DestroyContext),
                render: thunk!(Render),
                create_allocation: thunk!(CreateAllocation),
                destroy_allocation: thunk!(DestroyAllocation),
                lock: thunk!(Lock),
                unlock: thunk!(Unlock),
            })
        }
    }

    type Pfn<T> = unsafe extern "system" fn(*mut T) -> NTSTATUS;

    struct GdiThunks {
        open_adapter_from_hdc: Pfn<D3DKMT_OPENADAPTERFROMHDC>,
        open_adapter_from_gdi_display_name:
            Pfn<D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME>,
        close_adapter: Pfn<D3DKMT_CLOSEADAPTER>,
        escape: Pfn<D3DKMT_ESCAPE>,
        create_device: Pfn<D3DKMT_CREATEDEVICE>,
        destroy_device: Pfn<D3DKMT_DESTROYDEVICE>,
        create_context: Pfn<D3DKMT_CREATECONTEXT>,
        destroy_context: Pfn<D3DKMT_DESTROYCONTEXT>,
        render: Pfn<D3DKMT_RENDER>,
        create_allocation: Pfn<D3DKMT_CREATEALLOCATION>,
        destroy_allocation: Pfn<D3DKMT_DESTROYALLOCATION>,
        lock: Pfn<D3DKMT_LOCK>,
        unlock: Pfn<D3DKMT_UNLOCK>,
    }

    impl Thunks for GdiThunks {
        unsafe fn open_adapter_from_hdc(
            &self,
            data: &mut D3DKMT_OPENADAPTERFROMHDC,
        ) -> NTSTATUS {
            (self.open_adapter_from_hdc)(data)
        }
        unsafe fn open_adapter_from_gdi_display_name(
            &self,
            data: &mut D3DKMT_OPENADAPTERFROMGDIDISPLAYNAME,
        ) -> NTSTATUS {
            (self.open_adapter_from_gdi_display_name)(data)
        }
        unsafe fn close_adapter(
            &self,
            data: &mut D3DKMT_CLOSEADAPTER,
        ) -> NTSTATUS {
            (self.close_adapter)(data)
        }
        unsafe fn escape(&self, data: &mut D3DKMT_ESCAPE) -> NTSTATUS {
            (self.escape)(data)
        }
        unsafe fn create_device(
            &self,
            data: &mut D3DKMT_CREATEDEVICE,
        ) -> NTSTATUS {
            (self.create_device)(data)
        }
        unsafe fn destroy_device(
            &self,
            data: &mut D3DKMT_DESTROYDEVICE,
        ) -> NTSTATUS {
            (self.destroy_device)(data)
        }
        unsafe fn create_context(
            &self,
            data: &mut D3DKMT_CREATECONTEXT,
        ) -> NTSTATUS {
            (self.create_context)(data)
        }
        unsafe fn destroy_context(
            &self,
            data: &mut D3DKMT_DESTROYCONTEXT,
        ) -> NTSTATUS {
            (self.destroy_context)(data)
        }
        unsafe fn render(&self, data: &mut D3DKMT_RENDER) -> NTSTATUS {
            (self.render)(data)
        }
        unsafe fn create_allocation(
            &self,
            data: &mut D3DKMT_CREATEALLOCATION,
        ) -> NTSTATUS {
            (self.create_allocation)(data)
        }
        unsafe fn destroy_allocation(
            &self,
            data: &mut D3DKMT_DESTROYALLOCATION,
        ) -> NTSTATUS {
            (self.destroy_allocation)(data)
        }
        unsafe fn lock(&self, data: &mut D3DKMT_LOCK) -> NTSTATUS {
            (self.lock)(data)
        }
        unsafe fn unlock(&self, data: &mut D3DKMT_UNLOCK) -> NTSTATUS {
            (self.unlock)(data)
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn from_wide(buf: &[u16]) -> String {
        let len = buf.iter().position(|c| *c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..len])
    }

    impl Host for SystemHost {
        fn enum_display_device(&self, index: u32) -> Option<DisplayDevice> {
            // Safety: DISPLAY_DEVICEW is plain data
            let mut dev: DISPLAY_DEVICEW = unsafe { std::mem::zeroed() };
            dev.cb = std::mem::size_of::<DISPLAY_DEVICEW>() as u32;
            // Safety: `dev` is properly sized and typed for the call
            let ok = unsafe { EnumDisplayDevicesW(null(), index, &mut dev, 0) };
            if ok == 0 {
                return None;
            }
            Some(DisplayDevice {
                name: from_wide(&dev.DeviceName),
                primary: dev.StateFlags & DISPLAY_DEVICE_PRIMARY_DEVICE != 0,
            })
        }

        fn create_dc(&self, device_name: &str) -> Result<HDC> {
            let name = wide(device_name);
            // Safety: `name` is NUL-terminated and outlives the call
            let hdc =
                unsafe { CreateDCW(null(), name.as_ptr(), null(), null()) };
            if hdc == 0 {
                return Err(Error::last_os_error());
            }
            Ok(hdc)
        }

        fn release_dc(&self, hdc: HDC) {
            // Safety: `hdc` came from `create_dc`
            unsafe { DeleteDC(hdc) };
        }

        fn create_event(
            &self,
            manual_reset: bool,
            initial_state: bool,
        ) -> Result<HANDLE> {
            // Safety: unnamed event with default security
            let hdl = unsafe {
                CreateEventW(
                    null(),
                    manual_reset as i32,
                    initial_state as i32,
                    null(),
                )
            };
            if hdl == 0 {
                return Err(Error::last_os_error());
            }
            Ok(hdl)
        }

        fn create_semaphore(
            &self,
            initial: i32,
            maximum: i32,
        ) -> Result<HANDLE> {
            // Safety: unnamed semaphore with default security
            let hdl =
                unsafe { CreateSemaphoreW(null(), initial, maximum, null()) };
            if hdl == 0 {
                return Err(Error::last_os_error());
            }
            Ok(hdl)
        }

        fn close_handle(&self, handle: HANDLE) -> Result<()> {
            // Safety: closing a handle we were given ownership of
            if unsafe { CloseHandle(handle) } == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use std::io::{Error, ErrorKind, Result};

    use super::{SystemHost, SystemLoader};
    use crate::*;

    fn unsupported() -> Error {
        Error::new(ErrorKind::Unsupported, "windows required")
    }

    impl Loader for SystemLoader {
        fn load(&self, _name: &str) -> Result<Box<dyn Module>> {
            Err(unsupported())
        }
    }

    impl Host for SystemHost {
        fn enum_display_device(&self, _index: u32) -> Option<DisplayDevice> {
            None
        }
        fn create_dc(&self, _device_name: &str) -> Result<HDC> {
            Err(unsupported())
        }
        fn release_dc(&self, _hdc: HDC) {}
        fn create_event(
            &self,
            _manual_reset: bool,
            _initial_state: bool,
        ) -> Result<HANDLE> {
            Err(unsupported())
        }
        fn create_semaphore(
            &self,
            _initial: i32,
            _maximum: i32,
        ) -> Result<HANDLE> {
            Err(unsupported())
        }
        fn close_handle(&self, _handle: HANDLE) -> Result<()> {
            Err(unsupported())
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn system_loader_unavailable() {
            let mut cb = Callbacks::new();
            let res = cb.init(&SystemLoader, DEFAULT_DRIVER_MODULE);
            assert!(matches!(res, Err(crate::Error::NotAvailable(_))));
            assert!(!cb.is_initialized());
            assert_eq!(SystemHost.enum_display_device(0), None);
        }
    }
}
